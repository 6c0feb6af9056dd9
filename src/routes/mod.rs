use axum::Json;
use serde::Serialize;

pub mod admin;
pub mod payment;

/// Envelope shared by every successful JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<T>,
}

pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 0,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

pub async fn health() -> Json<ApiResponse<HealthStatus>> {
    success_to_api_response(HealthStatus { status: "ok" })
}
