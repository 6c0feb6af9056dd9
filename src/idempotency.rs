//! At-most-once execution per idempotency key.
//!
//! Flow for a keyed request: look up a cached response, otherwise take the
//! per-key lock, run the handler, cache a 2xx result and release the lock.
//! A caller that loses the lock race waits once for a bounded interval and
//! then either replays the winner's response or gets a conflict. The handler
//! never runs without the lock held, so a second execution can only happen
//! after the cache entry itself has expired.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    http::{Method, StatusCode},
    response::Response,
};

use crate::body::{Captured, collect_limited};

use crate::cache::{CacheKey, CacheKeyBuilder, CachedResponse, ResponseCacheOperations};
use crate::clock::{Clock, SystemClock};
use crate::events::{AdmissionEvent, EventSink, TracingEventSink};
use crate::store::{FailurePolicy, Store, StoreError, with_deadline};

/// Longest accepted `Idempotency-Key`, in bytes.
pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("{0}")]
    InvalidKey(String),
    #[error("a request with the same idempotency key is in progress")]
    Conflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a successful response is replayed.
    pub cache_ttl: Duration,
    /// Upper bound on how long a crashed holder can block its key.
    pub lock_ttl: Duration,
    /// How long a losing caller waits before re-checking the cache.
    pub contention_wait: Duration,
    pub hash_body: bool,
    pub hash_body_methods: Vec<Method>,
    /// Only these methods are deduplicated; `None` means all.
    pub methods: Option<Vec<Method>>,
    /// Responses with larger bodies are passed through uncached.
    pub max_body_bytes: usize,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 3600),
            lock_ttl: Duration::from_secs(30),
            contention_wait: Duration::from_millis(100),
            hash_body: false,
            hash_body_methods: vec![Method::POST, Method::PUT, Method::PATCH],
            methods: None,
            max_body_bytes: 1024 * 1024,
            store_timeout: Duration::from_secs(2),
            failure_policy: FailurePolicy::Closed,
        }
    }
}

/// The parts of a request that identify the operation.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyRequest<'a> {
    pub token: Option<&'a str>,
    pub method: &'a Method,
    pub path: &'a str,
    pub body: Option<&'a [u8]>,
}

#[derive(Debug)]
pub enum Outcome {
    /// No deduplication applied.
    Bypassed(Response),
    /// The handler ran under the lock.
    Executed(Response),
    /// A cached response was replayed; the handler did not run.
    Replayed(Response),
}

impl Outcome {
    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }

    pub fn into_response(self) -> Response {
        match self {
            Outcome::Bypassed(r) | Outcome::Executed(r) | Outcome::Replayed(r) => r,
        }
    }
}

pub fn validate_token(token: &str) -> Result<(), IdempotencyError> {
    if token.trim().is_empty() {
        return Err(IdempotencyError::InvalidKey(
            "idempotency key must not be empty".into(),
        ));
    }
    if token.len() > MAX_KEY_LEN {
        return Err(IdempotencyError::InvalidKey(format!(
            "idempotency key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Releases the lock if the holder exits without calling [`LockGuard::release`],
/// which covers cancellation and handler panics.
struct LockGuard {
    store: Arc<dyn Store>,
    /// Lock key and the token it was acquired under.
    held: Option<(String, String)>,
    timeout: Duration,
}

impl LockGuard {
    async fn release(mut self) {
        if let Some((key, token)) = self.held.take() {
            let released = with_deadline(
                "release_lock",
                self.timeout,
                self.store.release_lock(&key, &token),
            )
            .await;
            if let Err(e) = released {
                // the lock ttl reclaims it
                tracing::warn!("Failed to release idempotency lock {}: {}", key, e);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some((key, token)) = self.held.take() else {
            return;
        };
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.release_lock(&key, &token).await {
                        tracing::warn!("Failed to release abandoned lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime to release lock {}, left to ttl", key),
        }
    }
}

pub struct IdempotencyCoordinator {
    store: Arc<dyn Store>,
    config: IdempotencyConfig,
    keys: CacheKeyBuilder,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn Store>, config: IdempotencyConfig) -> Self {
        let keys = CacheKeyBuilder::new(config.hash_body, config.hash_body_methods.clone());
        Self {
            store,
            config,
            keys,
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Whether the request body is part of the key for this method.
    pub fn needs_body(&self, method: &Method) -> bool {
        self.keys.hashes_body(method)
    }

    fn applies_to(&self, method: &Method) -> bool {
        self.config
            .methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method))
    }

    pub async fn execute<F, Fut>(
        &self,
        request: IdempotencyRequest<'_>,
        handler: F,
    ) -> Result<Outcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let Some(token) = request.token else {
            return Ok(Outcome::Bypassed(handler().await));
        };
        if !self.applies_to(request.method) {
            return Ok(Outcome::Bypassed(handler().await));
        }
        if let Err(e) = validate_token(token) {
            self.events.record(AdmissionEvent::InvalidKey {
                reason: e.to_string(),
            });
            return Err(e);
        }

        let key = self
            .keys
            .build(token, request.method, request.path, request.body);

        match self.lookup(&key).await {
            Ok(Some(cached)) => return Ok(self.replay(&key, &cached)),
            Ok(None) => {}
            Err(e) => return self.on_store_failure(e, handler).await,
        }

        let lock_key = key.lock_key();
        let acquired = with_deadline(
            "acquire_lock",
            self.config.store_timeout,
            self.store.acquire_lock(&lock_key, self.config.lock_ttl),
        )
        .await;
        let token = match acquired {
            Ok(Some(token)) => token,
            Ok(None) => return self.await_in_flight(&key).await,
            Err(e) => return self.on_store_failure(e, handler).await,
        };

        let guard = LockGuard {
            store: self.store.clone(),
            held: Some((lock_key, token)),
            timeout: self.config.store_timeout,
        };

        // the previous holder may have finished between our lookup and our lock
        match self.lookup(&key).await {
            Ok(Some(cached)) => {
                guard.release().await;
                return Ok(self.replay(&key, &cached));
            }
            Ok(None) => {}
            Err(e) => {
                guard.release().await;
                return self.on_store_failure(e, handler).await;
            }
        }

        let response = handler().await;
        let response = self.capture_and_cache(&key, response).await;

        guard.release().await;
        Ok(Outcome::Executed(response))
    }

    fn not_cached(&self, key: &CacheKey, status: StatusCode) {
        self.events.record(AdmissionEvent::ResponseNotCached {
            key: key.to_string(),
            status: status.as_u16(),
        });
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError> {
        with_deadline(
            "get",
            self.config.store_timeout,
            ResponseCacheOperations::get_cached_response(
                self.store.as_ref(),
                key,
                self.clock.now(),
            ),
        )
        .await
    }

    fn replay(&self, key: &CacheKey, cached: &CachedResponse) -> Outcome {
        self.events.record(AdmissionEvent::CacheHit {
            key: key.to_string(),
        });
        Outcome::Replayed(cached.to_response())
    }

    async fn await_in_flight(&self, key: &CacheKey) -> Result<Outcome, IdempotencyError> {
        self.events.record(AdmissionEvent::LockContention {
            key: key.to_string(),
        });
        tokio::time::sleep(self.config.contention_wait).await;

        // a store failure here must not fall back to running the handler,
        // another request is executing it
        match self.lookup(key).await {
            Ok(Some(cached)) => Ok(self.replay(key, &cached)),
            Ok(None) => {
                self.events.record(AdmissionEvent::ConcurrentConflict {
                    key: key.to_string(),
                });
                Err(IdempotencyError::Conflict)
            }
            Err(e) => {
                self.events.record(AdmissionEvent::StoreFailure {
                    component: "idempotency",
                    error: e.to_string(),
                    failed_open: false,
                });
                Err(IdempotencyError::Store(e))
            }
        }
    }

    async fn on_store_failure<F, Fut>(
        &self,
        error: StoreError,
        handler: F,
    ) -> Result<Outcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let failed_open = self.config.failure_policy == FailurePolicy::Open;
        self.events.record(AdmissionEvent::StoreFailure {
            component: "idempotency",
            error: error.to_string(),
            failed_open,
        });

        if failed_open {
            Ok(Outcome::Bypassed(handler().await))
        } else {
            Err(IdempotencyError::Store(error))
        }
    }

    /// Buffers the handler's response, caches it when it is a 2xx, and hands
    /// back a response identical to the one the handler produced. A body that
    /// outgrows `max_body_bytes` or fails mid-stream is forwarded uncached.
    async fn capture_and_cache(&self, key: &CacheKey, response: Response) -> Response {
        let status = response.status();
        let too_large = response
            .body()
            .size_hint()
            .exact()
            .is_some_and(|len| len > self.config.max_body_bytes as u64);
        if !status.is_success() || too_large {
            self.not_cached(key, status);
            return response;
        }

        let (parts, body) = response.into_parts();
        let bytes = match collect_limited(body, self.config.max_body_bytes).await {
            Captured::Complete(bytes) => bytes,
            Captured::Passthrough(body) => {
                self.not_cached(key, status);
                return Response::from_parts(parts, body);
            }
        };

        let cached = CachedResponse::capture(
            parts.status,
            &parts.headers,
            &bytes,
            self.clock.now(),
            self.config.cache_ttl,
        );
        let stored = with_deadline(
            "set",
            self.config.store_timeout,
            ResponseCacheOperations::cache_response(
                self.store.as_ref(),
                key,
                &cached,
                self.config.cache_ttl,
            ),
        )
        .await;
        match stored {
            Ok(()) => self.events.record(AdmissionEvent::ResponseCached {
                key: key.to_string(),
                status: status.as_u16(),
            }),
            // the handler already ran; the caller still gets its response
            Err(e) => self.events.record(AdmissionEvent::StoreFailure {
                component: "idempotency",
                error: e.to_string(),
                failed_open: true,
            }),
        }

        Response::from_parts(parts, Body::from(bytes))
    }
}
