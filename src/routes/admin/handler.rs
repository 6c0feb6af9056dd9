use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::model::{RateLimitUsage, parse_subject};
use crate::AppState;
use crate::error::AppError;
use crate::routes::success_to_api_response;

#[axum::debug_handler]
pub async fn rate_limit_usage(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let parsed = parse_subject(&subject);
    let used = state.limiter.usage(&parsed).await?;
    let limit = state.limiter.limit_for(&parsed);

    Ok(success_to_api_response(RateLimitUsage {
        key: state.limiter.key_for(&parsed),
        subject,
        limit,
        used,
        remaining: limit.saturating_sub(used),
        reset_at: state.limiter.reset_at(),
    }))
}

#[axum::debug_handler]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<StatusCode, AppError> {
    state.limiter.reset(&parse_subject(&subject)).await?;
    Ok(StatusCode::NO_CONTENT)
}
