use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ingestflow_infra::error::PipelineError;
use ingestflow_infra::queue::QueueError;
use ingestflow_infra::redrive::RedriveError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ PipelineError::SchemaValidation => {
            json_error(StatusCode::BAD_REQUEST, "schema_validation_error", e.to_string())
        }
        PipelineError::CircuitOpen { dependency } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open",
            format!("{dependency} is temporarily unavailable"),
        ),
        e => {
            tracing::error!(error = %e, error_type = e.kind(), "failed to process event");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ingest_failed",
                "Failed to process event",
            )
        }
    }
}

pub fn redrive_error_to_response(err: RedriveError) -> axum::response::Response {
    match err {
        RedriveError::InvalidParameter(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_parameter", msg)
        }
        RedriveError::Queue(e) => queue_error_to_response(e),
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    let status = if err.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    json_error(status, "queue_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
