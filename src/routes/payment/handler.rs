use axum::{extract::Json, http::StatusCode, response::IntoResponse};

use super::model::{CreatePaymentRequest, Payment};
use crate::routes::success_to_api_response;

#[axum::debug_handler]
pub async fn create_payment(Json(req): Json<CreatePaymentRequest>) -> impl IntoResponse {
    let payment = Payment::create(req);
    tracing::info!(
        payment_id = %payment.payment_id,
        amount = payment.amount,
        "payment created"
    );
    (StatusCode::CREATED, success_to_api_response(payment))
}
