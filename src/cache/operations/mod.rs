/// Cache operations
/// Typed reads and writes on top of the raw store

// idempotent response cache
pub mod response;

pub use response::ResponseCacheOperations;
