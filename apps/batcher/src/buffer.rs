use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::outcome::{AverageOutput, Outcome};
use crate::stats::{AvgCache, PipelineStats};
use crate::validator::ValidatorApi;

pub const VALIDATOR_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// One window's artifacts, handed to the writer branch of the fan-out.
#[derive(Debug, Serialize)]
pub struct FlushOutcome {
    pub outcomes: Vec<Outcome>,
    pub avg_outputs: Vec<AverageOutput>,
}

/// Variant-specific half of a flush: bulk warehouse write, file append, or
/// stdout dump. The validator branch is shared by every buffered variant.
#[async_trait]
pub trait FlushWriter: Send + Sync {
    async fn flush(&self, data: &FlushOutcome) -> anyhow::Result<()>;
}

/// Wall-clock flush schedule. Windows are `[start_time + k*interval,
/// start_time + (k+1)*interval)` and the k-th flush fires at window end plus
/// `offset`, so alignment survives process restarts given a stable anchor.
#[derive(Debug, Clone, Copy)]
pub struct WindowParams {
    pub start_time: DateTime<Utc>,
    pub interval: Duration,
    pub offset: Duration,
}

impl WindowParams {
    pub fn next_flush_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.interval.as_millis() as i64;
        let offset_ms = self.offset.as_millis() as i64;
        let elapsed_ms = (now - self.start_time).num_milliseconds();
        let k = elapsed_ms.div_euclid(interval_ms) + 1;
        self.start_time + ChronoDuration::milliseconds(k * interval_ms + offset_ms)
    }

    /// Bounds of the window containing `now`.
    pub fn window_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let interval_ms = self.interval.as_millis() as i64;
        let elapsed_ms = (now - self.start_time).num_milliseconds();
        let k = elapsed_ms.div_euclid(interval_ms);
        let start = self.start_time + ChronoDuration::milliseconds(k * interval_ms);
        (start, start + ChronoDuration::milliseconds(interval_ms))
    }
}

/// Joined result of the two fan-out branches.
#[derive(Debug)]
pub struct FlushError {
    pub validator: Option<anyhow::Error>,
    pub writer: Option<anyhow::Error>,
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(err) = &self.validator {
            parts.push(format!("validator: {err}"));
        }
        if let Some(err) = &self.writer {
            parts.push(format!("writer: {err}"));
        }
        write!(f, "flush failed: {}", parts.join("; "))
    }
}

impl std::error::Error for FlushError {}

struct RunState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Accumulates outcomes between epoch-aligned ticks and fans each window out
/// to the validator and the variant writer.
pub struct MicrobatchBuffer {
    params: WindowParams,
    outcomes: Mutex<Vec<Outcome>>,
    cache: AvgCache,
    validator: Arc<dyn ValidatorApi>,
    writer: Arc<dyn FlushWriter>,
    stats: Arc<PipelineStats>,
    run: Mutex<Option<RunState>>,
}

impl MicrobatchBuffer {
    pub fn new(
        params: WindowParams,
        validator: Arc<dyn ValidatorApi>,
        writer: Arc<dyn FlushWriter>,
        stats: Arc<PipelineStats>,
    ) -> Arc<Self> {
        let (start, end) = params.window_bounds(Utc::now());
        Arc::new(Self {
            params,
            outcomes: Mutex::new(Vec::new()),
            cache: AvgCache::new(start, end),
            validator,
            writer,
            stats,
            run: Mutex::new(None),
        })
    }

    /// Buffers an outcome and folds it into the window averages. A project's
    /// first appearance in a window triggers a best-effort advisory notify;
    /// its failure is logged, never surfaced to the caller.
    pub fn add(self: &Arc<Self>, outcome: Outcome) {
        let newly_seen = self.cache.add(&outcome);
        let project_id = outcome.project_id.clone();
        {
            let mut outcomes = self.outcomes.lock().expect("buffer poisoned");
            outcomes.push(outcome);
            tracing::debug!(
                buffered = outcomes.len(),
                projects = self.cache.len(),
                "outcome buffered"
            );
        }

        if newly_seen {
            let validator = Arc::clone(&self.validator);
            tokio::spawn(async move {
                match tokio::time::timeout(NOTIFY_TIMEOUT, validator.notify_project(&project_id))
                    .await
                {
                    Ok(Ok(())) => {
                        tracing::debug!(project_id = %project_id, "validator notified of new project");
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(project_id = %project_id, error = %err, "failed to notify validator of new project");
                    }
                    Err(_) => {
                        tracing::warn!(project_id = %project_id, "validator notify timed out");
                    }
                }
            });
        }
    }

    /// Drains the current window. An empty window is a no-op with no
    /// downstream side effects. Otherwise both branches run concurrently and
    /// the cache is re-armed for the next window whether or not they
    /// succeeded: a failed window's aggregates are lost by design, keeping
    /// later windows aligned to the epoch anchor.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<(), FlushError> {
        let outcomes = {
            let mut guard = self.outcomes.lock().expect("buffer poisoned");
            if guard.is_empty() {
                tracing::debug!("nothing to flush");
                return Ok(());
            }
            std::mem::take(&mut *guard)
        };
        let avg_outputs = self.cache.get_outputs();
        let proto_outputs = self.cache.get_proto_outputs();
        tracing::info!(
            outcomes = outcomes.len(),
            projects = avg_outputs.len(),
            "flushing window"
        );

        let data = FlushOutcome {
            outcomes,
            avg_outputs,
        };

        let validator_branch = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(anyhow!("validator branch canceled")),
                res = tokio::time::timeout(
                    VALIDATOR_FLUSH_TIMEOUT,
                    self.validator.send_averages(proto_outputs),
                ) => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(anyhow::Error::new(err)),
                    Err(_) => Err(anyhow!("validator call timed out after {VALIDATOR_FLUSH_TIMEOUT:?}")),
                },
            }
        };
        let writer_branch = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(anyhow!("writer branch canceled")),
                res = tokio::time::timeout(WRITER_FLUSH_TIMEOUT, self.writer.flush(&data)) => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow!("writer flush timed out after {WRITER_FLUSH_TIMEOUT:?}")),
                },
            }
        };

        let (validator_res, writer_res) = tokio::join!(validator_branch, writer_branch);

        let (next_start, next_end) = self.params.window_bounds(Utc::now());
        self.cache.reset(next_start, next_end);

        self.stats.record_flush();
        tracing::info!(
            messages_received = self.stats.messages_received.load(Ordering::Relaxed),
            messages_dropped = self.stats.messages_dropped.load(Ordering::Relaxed),
            outcomes_delivered = self.stats.outcomes_delivered.load(Ordering::Relaxed),
            flushes = self.stats.flushes.load(Ordering::Relaxed),
            "pipeline stats"
        );

        match (validator_res, writer_res) {
            (Ok(()), Ok(())) => Ok(()),
            (validator, writer) => Err(FlushError {
                validator: validator.err(),
                writer: writer.err(),
            }),
        }
    }

    /// Launches the flush schedule loop. Idempotent: a second start is a
    /// no-op with a warning.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut run = self.run.lock().expect("buffer poisoned");
        if run.is_some() {
            tracing::warn!("buffer already started");
            return;
        }
        let cancel = parent.child_token();
        let buf = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { buf.schedule_loop(loop_cancel).await });
        *run = Some(RunState { cancel, handle });
    }

    async fn schedule_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            start_time = %self.params.start_time,
            interval_ms = self.params.interval.as_millis() as u64,
            offset_ms = self.params.offset.as_millis() as u64,
            "flush scheduler started"
        );
        loop {
            let now = Utc::now();
            let next = self.params.next_flush_at(now);
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = self.flush(&cancel).await {
                        tracing::error!(error = %err, "flush failed, window lost");
                    }
                }
            }
        }

        // The shutdown flush must not observe the canceled token, so it runs
        // on a fresh one.
        let fresh = CancellationToken::new();
        if let Err(err) = self.flush(&fresh).await {
            tracing::error!(error = %err, "final flush failed");
        }
        tracing::info!("flush scheduler stopped");
    }

    /// Cancels the schedule loop and waits for it to exit, which includes one
    /// final best-effort flush of anything still buffered.
    pub async fn stop(&self) {
        let state = { self.run.lock().expect("buffer poisoned").take() };
        match state {
            None => tracing::warn!("buffer not running or already stopped"),
            Some(run) => {
                run.cancel.cancel();
                if let Err(err) = run.handle.await {
                    tracing::error!(error = %err, "flush scheduler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{proto, ValidatorError};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockValidator {
        sent: Mutex<Vec<Vec<proto::AverageOutput>>>,
        notified: Mutex<Vec<String>>,
        fail_validation: AtomicBool,
    }

    impl MockValidator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                notified: Mutex::new(Vec::new()),
                fail_validation: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ValidatorApi for MockValidator {
        async fn send_averages(
            &self,
            averages: Vec<proto::AverageOutput>,
        ) -> Result<(), ValidatorError> {
            self.sent.lock().unwrap().push(averages);
            if self.fail_validation.load(Ordering::SeqCst) {
                return Err(ValidatorError::Validation(crate::validator::ValidationErrors {
                    errors: vec![proto::ValidationError {
                        project_id: "p1".to_string(),
                        message: "below contract threshold".to_string(),
                    }],
                }));
            }
            Ok(())
        }

        async fn notify_project(&self, project_id: &str) -> Result<(), ValidatorError> {
            self.notified.lock().unwrap().push(project_id.to_string());
            Ok(())
        }
    }

    struct MockWriter {
        flushes: Mutex<Vec<(usize, Vec<AverageOutput>)>>,
        fail: AtomicBool,
    }

    impl MockWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                flushes: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl FlushWriter for MockWriter {
        async fn flush(&self, data: &FlushOutcome) -> anyhow::Result<()> {
            self.flushes
                .lock()
                .unwrap()
                .push((data.outcomes.len(), data.avg_outputs.clone()));
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("warehouse unavailable");
            }
            Ok(())
        }
    }

    fn outcome(project: &str, net_output: f64) -> Outcome {
        Outcome {
            success: true,
            worker_id: 0,
            task_id: "t".to_string(),
            project_id: project.to_string(),
            data: Vec::new(),
            net_output,
            contract_threshold: 4.0,
            baseline: 9.0,
            duration_ms: 1,
            created_at: Utc::now(),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn flush_schedule_is_epoch_aligned() {
        let params = WindowParams {
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(30),
        };

        // t=0 and t=20s both flush at window end + offset = 90s.
        let t0 = params.start_time;
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap();
        assert_eq!(params.next_flush_at(t0), expected);
        assert_eq!(
            params.next_flush_at(t0 + ChronoDuration::seconds(20)),
            expected
        );
        // Exactly at the flush instant the next flush belongs to window 2.
        assert_eq!(
            params.next_flush_at(expected),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 30).unwrap()
        );
        // Anchors in the future still align.
        let before = t0 - ChronoDuration::seconds(10);
        assert_eq!(
            params.next_flush_at(before),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap()
        );
    }

    #[test]
    fn window_bounds_are_closed_open_and_contiguous() {
        let params = WindowParams {
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(30),
        };

        let (s0, e0) = params.window_bounds(params.start_time + ChronoDuration::seconds(59));
        assert_eq!(s0, params.start_time);
        assert_eq!(e0, params.start_time + ChronoDuration::seconds(60));

        // The flush instant for window 0 (t=90s) sits inside window 1.
        let (s1, e1) = params.window_bounds(params.start_time + ChronoDuration::seconds(90));
        assert_eq!(s1, e0);
        assert_eq!(e1, e0 + ChronoDuration::seconds(60));
    }

    #[tokio::test]
    async fn add_notifies_validator_once_per_project_per_window() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );

        buffer.add(outcome("p1", 10.0));
        buffer.add(outcome("p1", 20.0));
        buffer.add(outcome("p2", 5.0));
        settle().await;

        let mut notified = validator.notified.lock().unwrap().clone();
        notified.sort();
        assert_eq!(notified, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn empty_window_flush_has_no_side_effects() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let stats = Arc::new(PipelineStats::new());
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(params, validator.clone(), writer.clone(), stats.clone());

        buffer
            .flush(&CancellationToken::new())
            .await
            .expect("empty flush");

        assert!(validator.sent.lock().unwrap().is_empty());
        assert!(writer.flushes.lock().unwrap().is_empty());
        assert_eq!(stats.flushes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn flush_hands_both_artifacts_to_both_branches() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let stats = Arc::new(PipelineStats::new());
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(params, validator.clone(), writer.clone(), stats.clone());

        buffer.add(outcome("p1", 10.0));
        buffer.add(outcome("p1", 20.0));
        buffer
            .flush(&CancellationToken::new())
            .await
            .expect("flush");

        let sent = validator.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 1);
        assert_eq!(sent[0][0].project_id, "p1");
        assert_eq!(sent[0][0].average_output, 15.0);

        let flushes = writer.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0, 2);
        assert_eq!(flushes[0].1[0].average_output, 15.0);
        assert_eq!(stats.flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn scheduler_flushes_on_tick_and_skips_empty_windows() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_millis(300),
            offset: Duration::from_millis(100),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );
        let cancel = CancellationToken::new();
        buffer.start(&cancel);

        buffer.add(outcome("p1", 10.0));
        buffer.add(outcome("p1", 20.0));

        // Window 0 flushes at t=400ms; give it slack.
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(writer.flushes.lock().unwrap().len(), 1);
        assert_eq!(writer.flushes.lock().unwrap()[0].1[0].average_output, 15.0);

        // No adds in the following windows: no further side effects.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(writer.flushes.lock().unwrap().len(), 1);
        assert_eq!(validator.sent.lock().unwrap().len(), 1);

        buffer.stop().await;
    }

    #[tokio::test]
    async fn stop_performs_one_final_flush_of_buffered_state() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(3600),
            offset: Duration::from_secs(30),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );
        let cancel = CancellationToken::new();
        buffer.start(&cancel);

        buffer.add(outcome("p1", 12.5));
        buffer.stop().await;

        let flushes = writer.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0, 1);
        assert_eq!(flushes[0].1[0].average_output, 12.5);
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(3600),
            offset: Duration::from_secs(30),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );
        let cancel = CancellationToken::new();
        buffer.start(&cancel);
        buffer.start(&cancel);

        buffer.add(outcome("p1", 1.0));
        buffer.stop().await;
        assert_eq!(writer.flushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validator_failure_does_not_skip_the_writer() {
        let validator = MockValidator::new();
        validator.fail_validation.store(true, Ordering::SeqCst);
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );

        buffer.add(outcome("p1", 10.0));
        let err = buffer.flush(&CancellationToken::new()).await.unwrap_err();
        assert!(err.validator.is_some());
        assert!(err.writer.is_none());
        assert!(err.to_string().contains("validation failed"));

        // The warehouse branch still ran and the window was still retired.
        assert_eq!(writer.flushes.lock().unwrap().len(), 1);
        settle().await;
        buffer.add(outcome("p1", 30.0));
        settle().await;
        assert_eq!(validator.notified.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn writer_failure_does_not_skip_the_validator() {
        let validator = MockValidator::new();
        let writer = MockWriter::new();
        writer.fail.store(true, Ordering::SeqCst);
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );

        buffer.add(outcome("p1", 10.0));
        let err = buffer.flush(&CancellationToken::new()).await.unwrap_err();
        assert!(err.writer.is_some());
        assert!(err.validator.is_none());
        assert_eq!(validator.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_errors_lose_the_window_but_not_the_pipeline() {
        let validator = MockValidator::new();
        validator.fail_validation.store(true, Ordering::SeqCst);
        let writer = MockWriter::new();
        let params = WindowParams {
            start_time: Utc::now(),
            interval: Duration::from_secs(60),
            offset: Duration::from_secs(1),
        };
        let buffer = MicrobatchBuffer::new(
            params,
            validator.clone(),
            writer.clone(),
            Arc::new(PipelineStats::new()),
        );

        buffer.add(outcome("p1", 10.0));
        assert!(buffer.flush(&CancellationToken::new()).await.is_err());

        validator.fail_validation.store(false, Ordering::SeqCst);
        buffer.add(outcome("p1", 40.0));
        buffer
            .flush(&CancellationToken::new())
            .await
            .expect("second window flushes clean");

        let sent = validator.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        // The failed window's average did not leak into the next one.
        assert_eq!(sent[1][0].average_output, 40.0);
    }
}
