//! Backing store shared by the idempotency coordinator and the rate limiter.
//!
//! Callers only ever see `Arc<dyn Store>`. Every operation that guards a
//! correctness invariant (lock acquisition, rate-window mutation) is a single
//! atomic call on the backend.

pub mod memory;
pub mod redis_store;

pub use memory::{LocalStore, SweeperHandle};
pub use redis_store::{RedisStore, RedisStoreConfig};

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {message}")]
    Backend { message: String },
    #[error("store serialization failure: {message}")]
    Serialization { message: String },
    #[error("store operation `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: e.to_string(),
        }
    }
}

/// What a component does when the store fails or misses its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Proceed without the guarantee the store provides.
    Open,
    /// Reject the request.
    Closed,
}

/// Result of one atomic sliding-window update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Live entries after the update, including the new one when admitted.
    pub count: u64,
    /// Timestamp (ns) of the oldest live entry.
    pub oldest_ns: Option<i64>,
}

pub trait Store: Send + Sync {
    /// Returns the value if present and not expired.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Removes the value and any rate window stored under `key`.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Atomic test-and-set. Returns a token unique to this acquisition when
    /// the caller now holds the lock. An expired lock is free.
    fn acquire_lock<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Option<String>>;

    /// Deletes the lock only while it is still held under `token`; a holder
    /// whose ttl ran out cannot free the lock of the next holder.
    fn release_lock<'a>(&'a self, key: &'a str, token: &'a str) -> StoreFuture<'a, ()>;

    /// Prunes entries older than `now_ns - window`, counts the rest and, if
    /// the count is below `limit`, records `now_ns` and refreshes the key's
    /// expiry to `ttl`. All of it happens as one atomic unit per key.
    fn record_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
        limit: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, WindowOutcome>;

    /// Number of entries with timestamp >= `now_ns - window`. Read only.
    fn count_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
    ) -> StoreFuture<'a, u64>;
}

/// Runs a store future under a deadline; expiry becomes [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

pub(crate) fn window_start(now_ns: i64, window: Duration) -> i64 {
    now_ns.saturating_sub(i64::try_from(window.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Every operation fails as if the backend were unreachable.
    pub(crate) struct FailingStore;

    fn down() -> StoreError {
        StoreError::Backend {
            message: "connection refused".into(),
        }
    }

    impl Store for FailingStore {
        fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<String>> {
            Box::pin(async { Err(down()) })
        }
        fn set<'a>(&'a self, _key: &'a str, _value: String, _ttl: Duration) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(down()) })
        }
        fn delete<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(down()) })
        }
        fn acquire_lock<'a>(
            &'a self,
            _key: &'a str,
            _ttl: Duration,
        ) -> StoreFuture<'a, Option<String>> {
            Box::pin(async { Err(down()) })
        }
        fn release_lock<'a>(&'a self, _key: &'a str, _token: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(down()) })
        }
        fn record_in_window<'a>(
            &'a self,
            _key: &'a str,
            _now_ns: i64,
            _window: Duration,
            _limit: u64,
            _ttl: Duration,
        ) -> StoreFuture<'a, WindowOutcome> {
            Box::pin(async { Err(down()) })
        }
        fn count_in_window<'a>(
            &'a self,
            _key: &'a str,
            _now_ns: i64,
            _window: Duration,
        ) -> StoreFuture<'a, u64> {
            Box::pin(async { Err(down()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_turns_slow_operations_into_timeouts() {
        let result: Result<(), StoreError> = with_deadline("get", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(StoreError::Timeout {
                operation: "get",
                after: Duration::from_millis(10),
            })
        );
    }

    #[tokio::test]
    async fn deadline_passes_through_fast_results() {
        let result = with_deadline("get", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn window_start_saturates() {
        assert_eq!(window_start(10, Duration::from_nanos(4)), 6);
        assert_eq!(window_start(i64::MIN + 1, Duration::from_secs(1)), i64::MIN);
    }
}
