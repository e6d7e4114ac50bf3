use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::outcome::{Outcome, RealTimeDerRow};
use crate::telemetry::{decode_frames_at, FrameDecodeError};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error("received empty DER array")]
    EmptyFrame,
    #[error("frame mixes project ids {first:?} and {other:?}")]
    MixedProject { first: String, other: String },
}

impl TaskError {
    pub fn is_empty_frame(&self) -> bool {
        matches!(self, TaskError::EmptyFrame)
    }
}

/// A unit of work derived from one broker payload. The id is a pure function
/// of the payload bytes so retransmissions dedup to the same task.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: make_id(&payload),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn execute(&self, worker_id: usize) -> Result<Outcome, TaskError> {
        self.execute_at(worker_id, Utc::now())
    }

    pub(crate) fn execute_at(&self, worker_id: usize, now: DateTime<Utc>) -> Result<Outcome, TaskError> {
        let started = Instant::now();
        let frames = decode_frames_at(&self.payload, now)?;

        let Some(first) = frames.first() else {
            return Err(TaskError::EmptyFrame);
        };

        let project_id = first.project_id.clone();
        let contract_threshold = first.contract_threshold;
        let baseline = first.baseline;
        // Every DER in a frame reports the same meter; the first entry's
        // reading stands in for all of them.
        let mut net_output = first.power_meter_measurement;

        let mut data = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.project_id != project_id {
                return Err(TaskError::MixedProject {
                    first: project_id,
                    other: frame.project_id,
                });
            }
            net_output -= frame.current_output;
            data.push(RealTimeDerRow::new(frame));
        }

        Ok(Outcome {
            success: true,
            worker_id,
            task_id: self.id.clone(),
            project_id,
            data,
            net_output,
            contract_threshold,
            baseline,
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: now,
        })
    }
}

fn make_id(payload: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn frame_json(project: &str, der: &str, output: f64, meter: f64) -> String {
        format!(
            r#"{{"project_id": "{project}", "der_id": "{der}", "current_output": {output}, "power_meter_measurement": {meter}}}"#
        )
    }

    #[test]
    fn identical_payloads_produce_identical_ids() {
        let payload = format!("[{}]", frame_json("p1", "d1", 1.0, 5.0));
        let a = Task::new(payload.clone().into_bytes());
        let b = Task::new(payload.into_bytes());
        assert_eq!(a.id(), b.id());

        let c = Task::new(format!("[{}]", frame_json("p1", "d2", 1.0, 5.0)).into_bytes());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn task_id_is_urlsafe_base64_of_sha256() {
        let task = Task::new(b"[]".to_vec());
        // 32 hash bytes -> 43 unpadded base64 chars.
        assert_eq!(task.id().len(), 43);
        assert!(!task.id().contains('='));
        assert!(!task.id().contains('+'));
        assert!(!task.id().contains('/'));
    }

    #[test]
    fn net_output_is_meter_minus_summed_outputs() {
        let payload = format!(
            "[{},{}]",
            frame_json("p1", "d1", 3.0, 20.0),
            frame_json("p1", "d2", 5.0, 20.0)
        );
        let outcome = Task::new(payload.into_bytes())
            .execute_at(0, fixed_now())
            .expect("execute");
        assert_eq!(outcome.net_output, 12.0);
        assert_eq!(outcome.data.len(), 2);
        assert!(outcome.success);
        assert_eq!(outcome.project_id, "p1");
    }

    #[test]
    fn row_ids_are_fresh_per_execution() {
        let payload = format!("[{}]", frame_json("p1", "d1", 1.0, 5.0));
        let task = Task::new(payload.into_bytes());
        let first = task.execute_at(0, fixed_now()).expect("execute");
        let second = task.execute_at(0, fixed_now()).expect("execute");
        assert_ne!(first.data[0].id, second.data[0].id);
    }

    #[test]
    fn empty_array_fails_with_empty_frame() {
        let err = Task::new(b"[]".to_vec())
            .execute_at(0, fixed_now())
            .unwrap_err();
        assert!(err.is_empty_frame());
    }

    #[test]
    fn mixed_projects_fail() {
        let payload = format!(
            "[{},{}]",
            frame_json("proj-a", "d1", 1.0, 5.0),
            frame_json("proj-b", "d2", 1.0, 5.0)
        );
        let err = Task::new(payload.into_bytes())
            .execute_at(0, fixed_now())
            .unwrap_err();
        match err {
            TaskError::MixedProject { first, other } => {
                assert_eq!(first, "proj-a");
                assert_eq!(other, "proj-b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_json_fails_with_decode() {
        let err = Task::new(b"{not an array".to_vec())
            .execute_at(7, fixed_now())
            .unwrap_err();
        assert!(matches!(err, TaskError::Decode(_)));
    }
}
