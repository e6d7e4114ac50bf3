use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::outcome::{AverageOutput, Outcome};
use crate::validator::proto;

/// Pipeline counters, cheap enough to bump on every message. The buffer logs
/// a snapshot each time a window flushes.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub outcomes_delivered: AtomicU64,
    pub flushes: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.outcomes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Numerically simple running mean. Counts are bounded by one flush window of
/// ingest, so plain sum/count is fine at this precision.
#[derive(Debug)]
pub struct RunningAvg {
    sum: f64,
    count: u64,
    average: AverageOutput,
}

impl RunningAvg {
    fn new(outcome: &Outcome, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            average: AverageOutput {
                project_id: outcome.project_id.clone(),
                average_output: 0.0,
                baseline: outcome.baseline,
                contract_threshold: outcome.contract_threshold,
                start_time,
                end_time,
            },
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.average.average_output = self.sum / self.count as f64;
    }

    pub fn snapshot(&self) -> AverageOutput {
        self.average.clone()
    }
}

struct CacheInner {
    items: HashMap<String, RunningAvg>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

/// Per-project running averages for the current flush window. Callers get
/// copies out; nothing borrowed from the cache survives a `reset`.
pub struct AvgCache {
    inner: Mutex<CacheInner>,
}

impl AvgCache {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                items: HashMap::new(),
                start_time,
                end_time,
            }),
        }
    }

    /// Folds the outcome's net output into its project's running average.
    /// Returns whether the project was first seen in this window.
    pub fn add(&self, outcome: &Outcome) -> bool {
        let mut inner = self.inner.lock().expect("avg cache poisoned");
        let (start_time, end_time) = (inner.start_time, inner.end_time);
        let mut newly_inserted = false;
        let entry = inner
            .items
            .entry(outcome.project_id.clone())
            .or_insert_with(|| {
                newly_inserted = true;
                RunningAvg::new(outcome, start_time, end_time)
            });
        entry.add(outcome.net_output);
        newly_inserted
    }

    pub fn get_outputs(&self) -> Vec<AverageOutput> {
        let inner = self.inner.lock().expect("avg cache poisoned");
        inner.items.values().map(RunningAvg::snapshot).collect()
    }

    pub fn get_proto_outputs(&self) -> Vec<proto::AverageOutput> {
        let inner = self.inner.lock().expect("avg cache poisoned");
        inner
            .items
            .values()
            .map(|ra| proto::AverageOutput {
                project_id: ra.average.project_id.clone(),
                average_output: ra.average.average_output,
                baseline: ra.average.baseline,
                contract_threshold: ra.average.contract_threshold,
                start_time: rfc3339(ra.average.start_time),
                end_time: rfc3339(ra.average.end_time),
            })
            .collect()
    }

    /// Clears all entries and re-arms the cache for the next window.
    pub fn reset(&self, new_start: DateTime<Utc>, new_end: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("avg cache poisoned");
        inner.items.clear();
        inner.start_time = new_start;
        inner.end_time = new_end;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("avg cache poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
