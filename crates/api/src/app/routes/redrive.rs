//! Dead-letter redrive control surface.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use ingestflow_infra::redrive::{PreviewRequest, StartRequest};

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/preview", get(preview))
        .route("/start", post(start))
        .route("/cancel", post(cancel))
}

/// GET /redrive/preview?maxMessages=20&errorType=timeout&minAgeSeconds=0
pub async fn preview(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<PreviewRequest>, QueryRejection>,
) -> axum::response::Response {
    let Query(request) = match query {
        Ok(q) => q,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_parameter", e.body_text()),
    };

    match services.redrive.preview(request).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => errors::redrive_error_to_response(e),
    }
}

/// POST /redrive/start `{maxMessages, errorType, minAgeSeconds, perMessageDelayJitter}`
///
/// Runs to completion (or cancellation) and returns the run statistics.
/// An empty body uses the defaults.
pub async fn start(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_parameter",
                    format!("Invalid redrive request: {e}"),
                );
            }
        }
    };

    match services.redrive.start(request).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::redrive_error_to_response(e),
    }
}

/// POST /redrive/cancel
pub async fn cancel(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.redrive.cancel())
}
