use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{CacheKey, CachedResponse};
use crate::store::{Store, StoreError};

/// Idempotent response cache operations
pub struct ResponseCacheOperations;

impl ResponseCacheOperations {
    /// Fetches the cached response for `key`, ignoring records past their expiry.
    pub async fn get_cached_response(
        store: &dyn Store,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedResponse>, StoreError> {
        let result = store.get(key.as_str()).await?;

        match result {
            Some(json) => {
                let cached: CachedResponse = serde_json::from_str(&json)?;
                if cached.is_expired(now) {
                    Ok(None)
                } else {
                    Ok(Some(cached))
                }
            }
            None => Ok(None),
        }
    }

    /// Stores a captured response for the rest of its lifetime.
    /// Only successful responses are ever written.
    pub async fn cache_response(
        store: &dyn Store,
        key: &CacheKey,
        cached: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if !cached.is_success() {
            tracing::debug!("Not caching status {} under {}", cached.status_code, key);
            return Ok(());
        }
        let json = serde_json::to_string(cached)?;
        store.set(key.as_str(), json, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKeyBuilder;
    use crate::store::LocalStore;
    use axum::http::{HeaderMap, Method, StatusCode};

    #[tokio::test]
    async fn cached_response_round_trips_through_the_store() {
        let store = LocalStore::new();
        let key = CacheKeyBuilder::default().build("tok", &Method::POST, "/p", None);
        let now = Utc::now();
        let cached =
            CachedResponse::capture(StatusCode::OK, &HeaderMap::new(), b"ok", now, Duration::from_secs(30));

        ResponseCacheOperations::cache_response(&store, &key, &cached, Duration::from_secs(30))
            .await
            .unwrap();
        let loaded = ResponseCacheOperations::get_cached_response(&store, &key, now)
            .await
            .unwrap();

        assert_eq!(loaded, Some(cached));
    }

    #[tokio::test]
    async fn expired_record_is_not_observable() {
        let store = LocalStore::new();
        let key = CacheKeyBuilder::default().build("tok", &Method::POST, "/p", None);
        let now = Utc::now();
        let cached =
            CachedResponse::capture(StatusCode::OK, &HeaderMap::new(), b"ok", now, Duration::from_secs(1));

        // the store itself would still hold it for a minute
        ResponseCacheOperations::cache_response(&store, &key, &cached, Duration::from_secs(60))
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(2);

        assert_eq!(
            ResponseCacheOperations::get_cached_response(&store, &key, later)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn failed_responses_are_not_written() {
        let store = LocalStore::new();
        let key = CacheKeyBuilder::default().build("tok", &Method::POST, "/p", None);
        let now = Utc::now();
        let cached = CachedResponse::capture(
            StatusCode::INTERNAL_SERVER_ERROR,
            &HeaderMap::new(),
            b"boom",
            now,
            Duration::from_secs(30),
        );

        ResponseCacheOperations::cache_response(&store, &key, &cached, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(store.get(key.as_str()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let store = LocalStore::new();
        let key = CacheKeyBuilder::default().build("tok", &Method::POST, "/p", None);
        store
            .set(key.as_str(), "not json".into(), Duration::from_secs(5))
            .await
            .unwrap();

        let result = ResponseCacheOperations::get_cached_response(&store, &key, Utc::now()).await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }
}
