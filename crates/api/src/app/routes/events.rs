use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value as JsonValue;

use crate::app::{errors, services::AppServices};
use crate::context::RequestContext;

/// POST /events
///
/// Validates the order, assigns an idempotency key and enqueues it.
/// Responds 202 with `{message, messageId, idempotencyKey}`.
pub async fn ingest(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(request): Extension<RequestContext>,
    body: Bytes,
) -> axum::response::Response {
    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                format!("Invalid JSON payload: {e}"),
            );
        }
    };

    match services.ingest.ingest(payload, request.request_id()).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
