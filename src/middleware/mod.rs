mod admission;
mod auth;
mod error_handler;
mod rate_limit;

pub use admission::{Admission, IDEMPOTENCY_KEY, IDEMPOTENT_REPLAYED, admission};
pub use auth::admin_auth;
pub use error_handler::log_errors;
pub use rate_limit::{
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, apply_rate_limit_headers,
    client_ip, rate_limit,
};
