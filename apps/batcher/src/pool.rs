use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bus::BusEvent;
use crate::config::PoolConfig;
use crate::dedup::DedupSet;
use crate::destination::Destination;
use crate::stats::PipelineStats;
use crate::task::Task;

/// Fixed-size pool draining a bounded task queue into the destination.
/// Submission applies back-pressure; duplicate task ids are dropped before
/// they reach the queue.
pub struct WorkerPool {
    num_workers: usize,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    destination: Arc<dyn Destination>,
    dedup: Arc<DedupSet>,
    dedup_sweep: Duration,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    sweep_cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        cfg: &PoolConfig,
        destination: Arc<dyn Destination>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
        let sweep_cancel = cancel.child_token();
        tracing::info!(
            num_workers = cfg.num_workers,
            capacity = cfg.capacity,
            "task pool created"
        );
        Self {
            num_workers: cfg.num_workers,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            destination,
            dedup: Arc::new(DedupSet::new(Duration::from_secs(cfg.dedup_ttl_secs))),
            dedup_sweep: Duration::from_secs(cfg.dedup_sweep_secs),
            stats,
            cancel,
            sweep_cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let rx = self
            .rx
            .lock()
            .expect("pool poisoned")
            .take()
            .expect("pool already started");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.handles.lock().expect("pool poisoned");
        for worker_id in 0..self.num_workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&self.destination),
                Arc::clone(&self.stats),
                self.cancel.clone(),
            )));
        }
        handles.push(self.dedup.spawn_sweeper(self.dedup_sweep, self.sweep_cancel.clone()));
        tracing::info!("task pool started");
    }

    /// Accepts one bus event. Non-task events and duplicates are dropped
    /// here; a real task is a blocking enqueue, so back-pressure reaches the
    /// bus subscriber. A task is only dropped when the channel is already
    /// closed, which cannot happen before the bus subscription is torn down.
    pub async fn submit(&self, event: BusEvent) {
        let task = match event {
            BusEvent::Task(task) => task,
            BusEvent::BrokerStatus { connected } => {
                tracing::warn!(connected, "received non-task event, dropping");
                self.stats.record_dropped();
                return;
            }
        };

        self.stats.record_received();
        tracing::debug!(
            task_id = %task.id(),
            created_at = %task.created_at(),
            "received task from event bus"
        );
        if !self.dedup.add_if_absent(task.id()) {
            tracing::warn!(task_id = %task.id(), "skipping duplicate task");
            self.stats.record_dropped();
            return;
        }

        let tx = match self.tx.lock().expect("pool poisoned").clone() {
            Some(tx) => tx,
            None => {
                tracing::debug!(task_id = %task.id(), "pool closed, dropping task");
                self.stats.record_dropped();
                return;
            }
        };
        if tx.send(task).await.is_err() {
            tracing::debug!("task channel closed, dropping task");
            self.stats.record_dropped();
        }
    }

    /// Closes the task channel and joins every worker plus the sweeper.
    pub async fn wait(&self) {
        tracing::info!("shutting down task pool");
        self.tx.lock().expect("pool poisoned").take();
        self.sweep_cancel.cancel();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("pool poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker panicked");
            }
        }
        tracing::info!("task pool shutdown complete");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    destination: Arc<dyn Destination>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    loop {
        // Cancellation is only observed between tasks: anything already
        // dequeued runs to completion, queued tasks are abandoned to the
        // broker's redelivery.
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(worker_id, "cancelled, stopping worker");
                    return;
                }
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            tracing::debug!(worker_id, "task channel closed, stopping worker");
            return;
        };

        match task.execute(worker_id) {
            Ok(outcome) => {
                if let Err(err) = destination.add(outcome).await {
                    tracing::error!(worker_id, task_id = %task.id(), error = %err, "failed to add outcome to destination");
                    stats.record_dropped();
                } else {
                    stats.record_delivered();
                }
            }
            Err(err) if err.is_empty_frame() => {
                tracing::warn!(worker_id, task_id = %task.id(), "received empty DER array");
                stats.record_dropped();
            }
            Err(err) => {
                tracing::error!(worker_id, task_id = %task.id(), error = %err, "task execution failed");
                stats.record_dropped();
            }
        }
    }
}
