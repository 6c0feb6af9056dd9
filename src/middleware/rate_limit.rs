use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::rate_limit::{RateLimitDecision, RateLimiter, Subject};
use crate::store::StoreError;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client address: `x-real-ip`, then the first `x-forwarded-for` hop, then the
/// peer address of the connection.
pub fn client_ip<B>(req: &Request<B>) -> String {
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .or(remote_ip.as_deref())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}

pub fn apply_rate_limit_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp().max(0) as u64),
    );
}

/// Renders a rejected decision as a 429 with retry guidance.
pub fn rejection(decision: &RateLimitDecision) -> Response {
    let retry_after = decision
        .retry_after
        .unwrap_or_else(|| std::time::Duration::from_secs(1));
    // round up so clients never retry a moment too early
    let retry_after = std::time::Duration::from_secs(
        retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0),
    );

    let mut response = AppError::RateLimited { retry_after }.into_response();
    apply_rate_limit_headers(decision, response.headers_mut());
    response
}

/// Renders a limiter store failure as a 503 that still names the limit.
pub fn unavailable(error: StoreError, limit: u64) -> Response {
    let mut response = AppError::StoreUnavailable(error).into_response();
    response
        .headers_mut()
        .insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    response
}

/// Rate limiting only, keyed by client address.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    tracing::debug!("rate limit check for {}", ip);

    let subject = Subject::Address(ip);
    let decision = match limiter.allow(&subject).await {
        Ok(decision) => decision,
        Err(e) => return unavailable(e, limiter.limit_for(&subject)),
    };
    if !decision.allowed {
        return rejection(&decision);
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(&decision, response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", " 203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.9");

        let req = Request::builder()
            .header("x-real-ip", "198.51.100.4")
            .header("x-forwarded-for", "203.0.113.9")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.4");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let mut req = Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&req), "unknown");

        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert_eq!(client_ip(&req), "127.0.0.1");
    }
}
