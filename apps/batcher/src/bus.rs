use std::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::task::Task;

/// Everything the broker reader puts on the bus. The worker pool only
/// consumes tasks; other kinds are dropped there with a warning.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Task(Task),
    BrokerStatus { connected: bool },
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct BusInner<T> {
    subscribers: Vec<Subscriber<T>>,
    next_id: u64,
    closed: bool,
}

/// In-process fan-out. Publishing never blocks on a slow subscriber: a full
/// subscriber queue drops that subscriber's copy, the rest still receive.
pub struct EventBus<T> {
    inner: RwLock<BusInner<T>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    pub fn subscribe(&self, capacity: usize) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut inner = self.inner.write().expect("event bus poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.write().expect("event bus poisoned");
        inner.subscribers.retain(|s| s.id != id);
    }

    pub fn publish(&self, event: T) {
        let inner = self.inner.read().expect("event bus poisoned");
        if inner.closed {
            return;
        }
        for subscriber in &inner.subscribers {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = subscriber.id, "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = subscriber.id, "subscriber gone, dropping event");
                }
            }
        }
    }

    /// Drops every subscriber sender, closing their receivers. Publishing
    /// after close is a no-op.
    pub fn close(&self) {
        let mut inner = self.inner.write().expect("event bus poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }
}
