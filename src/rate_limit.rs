//! Sliding-window rate limiting over the shared store.
//!
//! Every admitted request leaves one timestamped entry under its subject's
//! key. A check prunes entries older than the window, counts the rest and
//! records the new request only when the count is below the limit, all in
//! one atomic store call, so concurrent callers can never push a key past its
//! limit. Capacity comes back one entry at a time as entries age out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::keys::{address_key, default_namespace, endpoint_namespace, identity_key};
use crate::clock::{Clock, SystemClock};
use crate::events::{AdmissionEvent, EventSink, TracingEventSink};
use crate::store::{FailurePolicy, Store, StoreError, with_deadline};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub limit: u64,
    pub window: Duration,
    /// Limit applied to authenticated subjects instead of `limit`.
    pub per_identity_override: Option<u64>,
    /// Added to the window when refreshing a key's expiry so idle keys vanish.
    pub safety_margin: Duration,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            per_identity_override: None,
            safety_margin: Duration::from_secs(1),
            store_timeout: Duration::from_millis(500),
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// Who is being limited. The two scopes never share counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Address(String),
    Identity(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Advisory only: a sliding window has no single reset instant.
    pub reset_at: DateTime<Utc>,
    /// Set on rejection: when the oldest entry leaves the window.
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    config: RateLimiterConfig,
    namespace: String,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            namespace: default_namespace(),
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// A limiter with its own limit and window whose keys never overlap
    /// with the default limiter's.
    pub fn for_endpoint(
        store: Arc<dyn Store>,
        endpoint: &str,
        limit: u64,
        window: Duration,
    ) -> Self {
        let config = RateLimiterConfig {
            limit,
            window,
            ..RateLimiterConfig::default()
        };
        let mut limiter = Self::new(store, config);
        limiter.namespace = endpoint_namespace(endpoint);
        limiter
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn key_for(&self, subject: &Subject) -> String {
        match subject {
            Subject::Address(addr) => address_key(&self.namespace, addr),
            Subject::Identity(id) => identity_key(&self.namespace, id),
        }
    }

    pub fn limit_for(&self, subject: &Subject) -> u64 {
        match subject {
            Subject::Identity(_) => self
                .config
                .per_identity_override
                .unwrap_or(self.config.limit),
            Subject::Address(_) => self.config.limit,
        }
    }

    pub async fn allow(&self, subject: &Subject) -> Result<RateLimitDecision, StoreError> {
        self.allow_with_limit(subject, self.limit_for(subject)).await
    }

    /// Admits or rejects one request for `subject` against `limit`.
    ///
    /// A store failure admits the request under [`FailurePolicy::Open`] and
    /// is returned as an error under [`FailurePolicy::Closed`].
    pub async fn allow_with_limit(
        &self,
        subject: &Subject,
        limit: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = self.key_for(subject);
        let now = self.clock.now();
        let now_ns = self.clock.now_nanos();
        let reset_at = self.advisory_reset(now);

        let outcome = with_deadline(
            "record_in_window",
            self.config.store_timeout,
            self.store.record_in_window(
                &key,
                now_ns,
                self.config.window,
                limit,
                self.config.window + self.config.safety_margin,
            ),
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed_open = self.config.failure_policy == FailurePolicy::Open;
                self.events.record(AdmissionEvent::StoreFailure {
                    component: "rate_limit",
                    error: e.to_string(),
                    failed_open,
                });
                if !failed_open {
                    return Err(e);
                }
                return Ok(RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at,
                    retry_after: None,
                });
            }
        };

        if outcome.admitted {
            return Ok(RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(outcome.count),
                reset_at,
                retry_after: None,
            });
        }

        self.events.record(AdmissionEvent::RateLimited {
            key: key.clone(),
            limit,
        });
        Ok(RateLimitDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(self.retry_after(now_ns, outcome.oldest_ns)),
        })
    }

    fn retry_after(&self, now_ns: i64, oldest_ns: Option<i64>) -> Duration {
        let window = self.config.window;
        let Some(oldest) = oldest_ns else {
            return window;
        };
        let window_ns = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
        let frees_at = oldest.saturating_add(window_ns);
        let wait = frees_at.saturating_sub(now_ns).max(0) as u64;
        Duration::from_nanos(wait).min(window)
    }

    fn advisory_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Requests counted in the current window for `subject`.
    pub async fn usage(&self, subject: &Subject) -> Result<u64, StoreError> {
        let key = self.key_for(subject);
        with_deadline(
            "count_in_window",
            self.config.store_timeout,
            self.store
                .count_in_window(&key, self.clock.now_nanos(), self.config.window),
        )
        .await
    }

    pub async fn remaining(&self, subject: &Subject) -> Result<u64, StoreError> {
        let used = self.usage(subject).await?;
        Ok(self.limit_for(subject).saturating_sub(used))
    }

    /// Now plus the window. Approximate by nature of the sliding window.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.advisory_reset(self.clock.now())
    }

    /// Drops every recorded entry for `subject`.
    pub async fn reset(&self, subject: &Subject) -> Result<(), StoreError> {
        let key = self.key_for(subject);
        tracing::info!("Resetting rate limit window {}", key);
        with_deadline("delete", self.config.store_timeout, self.store.delete(&key)).await
    }
}
