use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::error;

use crate::body::{Captured, collect_limited};

/// Error bodies up to this size are logged; larger ones pass through unlogged.
const LOGGED_BODY_LIMIT: usize = 1024;

/// Logs every 5xx produced below this layer, including store outages
/// surfaced by the admission pipeline. The response reaches the client unchanged.
pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if !response.status().is_server_error() {
        return response;
    }

    let (parts, body) = response.into_parts();
    match collect_limited(body, LOGGED_BODY_LIMIT).await {
        Captured::Complete(bytes) => {
            error!(
                %method,
                %path,
                status = %parts.status,
                "Server error occurred: {}",
                String::from_utf8_lossy(&bytes)
            );
            Response::from_parts(parts, Body::from(bytes))
        }
        Captured::Passthrough(body) => {
            error!(
                %method,
                %path,
                status = %parts.status,
                "Server error occurred, body over {} bytes not logged",
                LOGGED_BODY_LIMIT
            );
            Response::from_parts(parts, body)
        }
    }
}
