use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingestflow_infra::fault::FailureMode;
use ingestflow_infra::queue::QueueDepth;
use ingestflow_infra::resilience::BreakerSnapshot;
use ingestflow_infra::worker::WorkerStats;

use crate::app::errors;

/// Service name reported by `/health`.
pub const SERVICE_NAME: &str = "ingestflow";

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SetFailureModeRequest {
    pub mode: String,
}

impl SetFailureModeRequest {
    /// Only the known modes can be switched to at runtime.
    pub fn into_mode(self) -> Result<FailureMode, axum::response::Response> {
        match FailureMode::from(self.mode) {
            FailureMode::Unknown(raw) => Err(errors::json_error(
                axum::http::StatusCode::BAD_REQUEST,
                "invalid_failure_mode",
                format!(
                    "unknown failure mode '{raw}'; expected one of: none, poison_payload, slow_downstream, random_fail_p30"
                ),
            )),
            mode => Ok(mode),
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureModeResponse {
    pub failure_mode: FailureMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    pub failure_mode: FailureMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueDepth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub breakers: Vec<BreakerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerStats>,
}
