use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
}

/// A freshly generated id per execution makes replays observable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn create(req: CreatePaymentRequest) -> Self {
        Self {
            payment_id: Uuid::new_v4().to_string(),
            amount: req.amount,
            currency: req.currency.to_uppercase(),
            description: req.description,
            created_at: Utc::now(),
        }
    }
}
