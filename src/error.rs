use std::time::Duration;

use axum::Json;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::idempotency::IdempotencyError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
    #[error("a request with this idempotency key is already in progress")]
    ConcurrentDuplicate,
    #[error("too many requests, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("missing or invalid admin credentials")]
    Unauthorized,
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("backing store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("internal server error")]
    InternalServerError,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    error_message: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,
            AppError::ConcurrentDuplicate => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IdempotencyError> for AppError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::InvalidKey(reason) => AppError::InvalidIdempotencyKey(reason),
            IdempotencyError::Conflict => AppError::ConcurrentDuplicate,
            IdempotencyError::Store(e) => AppError::StoreUnavailable(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            AppError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            // 409 is retryable once the in-flight request finishes
            AppError::ConcurrentDuplicate => Some(1),
            _ => None,
        };

        let body = Json(ErrorResponse {
            code: status.as_u16() as i32,
            error_message: self.to_string(),
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
