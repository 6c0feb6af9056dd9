use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rate_limit::Subject;

#[derive(Debug, Serialize)]
pub struct RateLimitUsage {
    pub subject: String,
    pub key: String,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// `user:<id>` names an identity, `ip:<addr>` or a bare value an address.
pub fn parse_subject(raw: &str) -> Subject {
    if let Some(id) = raw.strip_prefix("user:") {
        Subject::Identity(id.to_string())
    } else {
        Subject::Address(raw.strip_prefix("ip:").unwrap_or(raw).to_string())
    }
}
