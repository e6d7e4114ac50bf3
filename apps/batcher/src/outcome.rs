use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::telemetry::DerFrame;

/// One warehouse row: a DER snapshot plus its generated row id.
#[derive(Debug, Clone, Serialize)]
pub struct RealTimeDerRow {
    pub id: Uuid,
    #[serde(flatten)]
    pub der: DerFrame,
}

impl RealTimeDerRow {
    pub fn new(der: DerFrame) -> Self {
        Self {
            id: Uuid::new_v4(),
            der,
        }
    }
}

/// Result of executing one task. Owned by the buffer from `add` until a flush
/// snapshot hands it to the fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub worker_id: usize,
    pub task_id: String,
    pub project_id: String,
    pub data: Vec<RealTimeDerRow>,
    pub net_output: f64,
    pub contract_threshold: f64,
    pub baseline: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-project aggregate over one flush window, closed-open bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AverageOutput {
    pub project_id: String,
    pub average_output: f64,
    pub baseline: f64,
    pub contract_threshold: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
