use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::warn;

use crate::app::dto::{FailureModeResponse, HealthResponse, SetFailureModeRequest, SERVICE_NAME};
use crate::app::services::AppServices;

/// GET /health
///
/// Probes the primary queue; 503 when it cannot report its depth.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let ctx = &services.ctx;
    let (status, queue, error) = match ctx.queue.depth().await {
        Ok(depth) => (StatusCode::OK, Some(depth), None),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, None, Some(e.to_string()))
        }
    };

    let body = HealthResponse {
        status: if status.is_success() { "healthy" } else { "unhealthy" },
        service: SERVICE_NAME,
        environment: ctx.config.env_name.clone(),
        timestamp: ctx.clock.now(),
        failure_mode: ctx.faults.mode(),
        queue,
        error,
        breakers: ctx.breakers.snapshots(),
        workers: services.worker_stats(),
    };

    (status, Json(body)).into_response()
}

/// GET /failure-mode
pub async fn get_failure_mode(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(FailureModeResponse {
        failure_mode: services.ctx.faults.mode(),
    })
}

/// PUT /failure-mode `{ "mode": "random_fail_p30" }`
///
/// Takes effect for the next message ingested or processed.
pub async fn set_failure_mode(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<SetFailureModeRequest>,
) -> axum::response::Response {
    let mode = match req.into_mode() {
        Ok(mode) => mode,
        Err(resp) => return resp,
    };

    services.ctx.faults.set_mode(mode.clone());
    Json(FailureModeResponse { failure_mode: mode }).into_response()
}
