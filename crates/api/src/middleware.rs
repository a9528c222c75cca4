use axum::{
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use ingestflow_core::RequestId;

use crate::context::RequestContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach a [`RequestContext`] to every request and echo its id back.
///
/// A well-formed `x-request-id` from the caller is reused; anything else
/// gets a fresh id.
pub async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = extract_request_id(req.headers()).unwrap_or_default();
    req.extensions_mut().insert(RequestContext::new(request_id));

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

fn extract_request_id(headers: &HeaderMap) -> Option<RequestId> {
    headers
        .get(REQUEST_ID_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
