/// Cache key module
/// Builds every key the admission layer writes to the store

// idempotency keys
pub mod idempotency_keys;

// rate limit window keys
pub mod rate_limit_keys;

pub use idempotency_keys::{CacheKey, CacheKeyBuilder, body_hash};
pub use rate_limit_keys::{address_key, default_namespace, endpoint_namespace, identity_key};
