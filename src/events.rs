//! Operational events emitted by the admission layer.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A cached response was replayed instead of running the handler.
    CacheHit { key: String },
    /// Another request held the execution lock.
    LockContention { key: String },
    /// The lock holder had not finished within the wait; the caller got a conflict.
    ConcurrentConflict { key: String },
    ResponseCached { key: String, status: u16 },
    /// Non-2xx or oversized responses are passed through without caching.
    ResponseNotCached { key: String, status: u16 },
    InvalidKey { reason: String },
    RateLimited { key: String, limit: u64 },
    StoreFailure {
        component: &'static str,
        error: String,
        failed_open: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: AdmissionEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: AdmissionEvent) {
        match event {
            AdmissionEvent::CacheHit { key } => {
                tracing::info!(%key, "idempotent replay");
            }
            AdmissionEvent::LockContention { key } => {
                tracing::info!(%key, "idempotency lock contention");
            }
            AdmissionEvent::ConcurrentConflict { key } => {
                tracing::warn!(%key, "concurrent duplicate rejected");
            }
            AdmissionEvent::ResponseCached { key, status } => {
                tracing::debug!(%key, status, "response cached");
            }
            AdmissionEvent::ResponseNotCached { key, status } => {
                tracing::debug!(%key, status, "response not cached");
            }
            AdmissionEvent::InvalidKey { reason } => {
                tracing::info!(%reason, "invalid idempotency key");
            }
            AdmissionEvent::RateLimited { key, limit } => {
                tracing::info!(%key, limit, "rate limit exceeded");
            }
            AdmissionEvent::StoreFailure {
                component,
                error,
                failed_open,
            } => {
                tracing::error!(component, %error, failed_open, "store failure");
            }
        }
    }
}

/// Keeps every event in memory; handy for assertions.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: AdmissionEvent) {
        self.events.lock().push(event);
    }
}
