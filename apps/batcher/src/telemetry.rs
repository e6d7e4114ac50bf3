use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One DER snapshot as carried on the broker, timestamps already resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerFrame {
    pub project_id: String,
    pub der_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub der_type: String,
    pub is_online: bool,
    pub timestamp: DateTime<Utc>,
    pub current_output: f64,
    pub units: String,
    pub is_standalone: bool,
    pub connection_start_at: DateTime<Utc>,
    pub current_soc: f64,
    pub nameplate_capacity: f64,
    pub contract_threshold: f64,
    pub baseline: f64,
    pub power_meter_measurement: f64,
}

// Field presence mirrors what devices actually send: everything defaults so
// a sparse frame still decodes, and the task layer decides what is fatal.
#[derive(Debug, Deserialize)]
struct WireDer<'a> {
    #[serde(default, borrow)]
    project_id: Option<&'a str>,
    #[serde(default, borrow)]
    der_id: Option<&'a str>,
    #[serde(default, borrow)]
    device_id: Option<&'a str>,
    #[serde(rename = "type", default, borrow)]
    der_type: Option<&'a str>,
    #[serde(default)]
    is_online: bool,
    #[serde(default, borrow)]
    timestamp: Option<&'a str>,
    #[serde(default)]
    current_output: f64,
    #[serde(default, borrow)]
    units: Option<&'a str>,
    #[serde(default)]
    is_standalone: bool,
    #[serde(default, borrow)]
    connection_start_at: Option<&'a str>,
    #[serde(default)]
    current_soc: f64,
    #[serde(default)]
    nameplate_capacity: f64,
    #[serde(default)]
    contract_threshold: f64,
    #[serde(default)]
    baseline: f64,
    #[serde(default)]
    power_meter_measurement: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("failed to parse message payload: {0}")]
    Json(#[from] simd_json::Error),
    #[error("invalid timestamp {raw:?} in field {field}")]
    Timestamp { field: &'static str, raw: String },
}

/// Decode a broker payload as a JSON array of DER snapshots.
///
/// Upstream devices omit timestamps when their clock is not yet synced, so an
/// absent, null, or empty timestamp resolves to `now`. A present but malformed
/// timestamp is still an error.
pub fn decode_frames_at(payload: &[u8], now: DateTime<Utc>) -> Result<Vec<DerFrame>, FrameDecodeError> {
    // simd-json parses in place; the caller's payload must stay untouched
    // because the task id is a hash over the original bytes.
    let mut bytes = payload.to_vec();
    let wire: Vec<WireDer> = simd_json::from_slice(&mut bytes)?;
    wire.into_iter().map(|w| resolve(w, now)).collect()
}

fn resolve(wire: WireDer<'_>, now: DateTime<Utc>) -> Result<DerFrame, FrameDecodeError> {
    Ok(DerFrame {
        project_id: wire.project_id.unwrap_or_default().to_string(),
        der_id: wire.der_id.unwrap_or_default().to_string(),
        device_id: wire.device_id.unwrap_or_default().to_string(),
        der_type: wire.der_type.unwrap_or_default().to_string(),
        is_online: wire.is_online,
        timestamp: permissive_timestamp("timestamp", wire.timestamp, now)?,
        current_output: wire.current_output,
        units: wire.units.unwrap_or_default().to_string(),
        is_standalone: wire.is_standalone,
        connection_start_at: permissive_timestamp(
            "connection_start_at",
            wire.connection_start_at,
            now,
        )?,
        current_soc: wire.current_soc,
        nameplate_capacity: wire.nameplate_capacity,
        contract_threshold: wire.contract_threshold,
        baseline: wire.baseline,
        power_meter_measurement: wire.power_meter_measurement,
    })
}

fn permissive_timestamp(
    field: &'static str,
    raw: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, FrameDecodeError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(now),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| FrameDecodeError::Timestamp {
                field,
                raw: s.to_string(),
            }),
    }
}
