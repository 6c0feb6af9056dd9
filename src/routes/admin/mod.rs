mod handler;
mod model;

pub use handler::{rate_limit_usage, reset_rate_limit};
pub use model::{RateLimitUsage, parse_subject};
