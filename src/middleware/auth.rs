use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::AppState;
use crate::error::AppError;

/// Admits only callers presenting `Authorization: Bearer <ADMIN_TOKEN>`.
pub async fn admin_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return AppError::Unauthorized.into_response();
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(token) if tokens_match(token.trim(), expected) => next.run(req).await,
        _ => {
            tracing::warn!(path = %req.uri().path(), "Rejected admin request");
            AppError::Unauthorized.into_response()
        }
    }
}

// digests have a fixed length, so the comparison does not leak the token length
fn tokens_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_token_matches() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }
}
