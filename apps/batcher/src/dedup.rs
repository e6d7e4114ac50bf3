use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Time-windowed set of task ids. An id seen within the TTL will not be
/// admitted again; memory stays bounded at inflight rate x TTL.
pub struct DedupSet {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns true when the id was not present (or had expired).
    pub fn add_if_absent(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("dedup set poisoned");
        match entries.get(id) {
            Some(&expires_at) if expires_at > now => false,
            _ => {
                entries.insert(id.to_string(), now + self.ttl);
                true
            }
        }
    }

    /// Evicts expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("dedup set poisoned");
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dedup set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = set.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = set.len(), "swept dedup set");
                        }
                    }
                }
            }
        })
    }
}
