// Cache module
// Keys, records and typed operations for the admission layer's store entries

pub mod keys;
pub mod models;
pub mod operations;

pub use keys::{CacheKey, CacheKeyBuilder};
pub use models::CachedResponse;
pub use operations::ResponseCacheOperations;
