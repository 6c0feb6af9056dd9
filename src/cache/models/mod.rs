/// Cache data models
/// Shapes of the records the admission layer keeps in the store

// captured idempotent responses
pub mod response;

pub use response::CachedResponse;
