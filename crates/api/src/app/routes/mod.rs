use axum::{
    routing::{get, post},
    Router,
};

pub mod events;
pub mod redrive;
pub mod system;

/// Router for the pipeline endpoints (everything except `/health`).
pub fn router() -> Router {
    Router::new()
        .route("/events", post(events::ingest))
        .route(
            "/failure-mode",
            get(system::get_failure_mode).put(system::set_failure_mode),
        )
        .nest("/redrive", redrive::router())
}
