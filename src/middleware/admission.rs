use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::rate_limit::{apply_rate_limit_headers, client_ip, rejection, unavailable};
use crate::error::AppError;
use crate::idempotency::{IdempotencyCoordinator, IdempotencyRequest};
use crate::identity::IdentityResolver;
use crate::rate_limit::{RateLimiter, Subject};

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const IDEMPOTENT_REPLAYED: HeaderName = HeaderName::from_static("idempotent-replayed");

/// Rate limiting followed by idempotency coordination, in that order.
pub struct Admission {
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyCoordinator>,
    pub identity: Arc<dyn IdentityResolver>,
    /// Limit authenticated callers by subject instead of by address.
    pub per_identity: bool,
    /// Largest request body buffered for body hashing.
    pub max_request_body: usize,
}

impl Admission {
    pub fn subject_for<B>(&self, req: &Request<B>) -> Subject {
        if self.per_identity {
            if let Some(id) = self.identity.resolve(req.headers()) {
                return Subject::Identity(id);
            }
        }
        Subject::Address(client_ip(req))
    }
}

fn mark_replayed(response: &mut Response, replayed: bool) {
    response.headers_mut().insert(
        IDEMPOTENT_REPLAYED,
        HeaderValue::from_static(if replayed { "true" } else { "false" }),
    );
}

pub async fn admission(
    State(admission): State<Arc<Admission>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let subject = admission.subject_for(&req);
    let decision = match admission.limiter.allow(&subject).await {
        Ok(decision) => decision,
        Err(e) => {
            let mut response = unavailable(e, admission.limiter.limit_for(&subject));
            mark_replayed(&mut response, false);
            return response;
        }
    };
    if !decision.allowed {
        let mut response = rejection(&decision);
        mark_replayed(&mut response, false);
        return response;
    }

    let mut response = coordinate(&admission, req, next).await;
    apply_rate_limit_headers(&decision, response.headers_mut());
    response
}

async fn coordinate(admission: &Admission, req: Request<Body>, next: Next) -> Response {
    let token = match req.headers().get(&IDEMPOTENCY_KEY).map(|v| v.to_str()) {
        None => None,
        Some(Ok(token)) => Some(token.to_string()),
        Some(Err(_)) => {
            let mut response = AppError::InvalidIdempotencyKey(
                "idempotency key must be visible ASCII".into(),
            )
            .into_response();
            mark_replayed(&mut response, false);
            return response;
        }
    };
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // the handler gets the same bytes back, the coordinator gets a copy to hash
    let (req, body) = if token.is_some() && admission.idempotency.needs_body(&method) {
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, admission.max_request_body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::info!("Rejecting unbuffered request body: {}", e);
                let mut response = AppError::PayloadTooLarge.into_response();
                mark_replayed(&mut response, false);
                return response;
            }
        };
        (Request::from_parts(parts, Body::from(bytes.clone())), Some(bytes))
    } else {
        (req, None)
    };

    let request = IdempotencyRequest {
        token: token.as_deref(),
        method: &method,
        path: &path,
        body: body.as_deref(),
    };
    let (mut response, replayed) =
        match admission.idempotency.execute(request, move || next.run(req)).await {
            Ok(outcome) => {
                let replayed = outcome.is_replay();
                (outcome.into_response(), replayed)
            }
            Err(e) => (AppError::from(e).into_response(), false),
        };

    mark_replayed(&mut response, replayed);
    response
}
