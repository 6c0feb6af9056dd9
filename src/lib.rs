use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use config::Config;

use events::{EventSink, TracingEventSink};
use identity::{IdentityResolver, JwtIdentityResolver, NoIdentity};
use idempotency::IdempotencyCoordinator;
use middleware::{Admission, admin_auth, admission, log_errors};
use rate_limit::RateLimiter;
use store::Store;

mod body;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod idempotency;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod store;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub limiter: Arc<RateLimiter>,
    pub admission: Arc<Admission>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self::with_events(config, store, Arc::new(TracingEventSink))
    }

    pub fn with_events(config: Config, store: Arc<dyn Store>, events: Arc<dyn EventSink>) -> Self {
        let limiter = Arc::new(
            RateLimiter::new(store.clone(), config.rate_limiter_config())
                .with_events(events.clone()),
        );
        let idempotency_config = config.idempotency_config();
        let max_request_body = idempotency_config.max_body_bytes;
        let idempotency = Arc::new(
            IdempotencyCoordinator::new(store.clone(), idempotency_config).with_events(events),
        );
        let identity: Arc<dyn IdentityResolver> = match config.jwt_secret.as_deref() {
            Some(secret) => Arc::new(JwtIdentityResolver::new(secret)),
            None => Arc::new(NoIdentity),
        };

        let admission = Arc::new(Admission {
            limiter: limiter.clone(),
            idempotency,
            identity,
            per_identity: config.rate_limit_per_identity,
            max_request_body,
        });

        Self {
            config,
            store,
            limiter,
            admission,
        }
    }
}

/// Demo routes behind the admission pipeline. `/health` is never limited.
/// Admin endpoints exist only when an admin token is configured.
pub fn app(state: AppState) -> Router {
    let mut admitted: Router<AppState> = Router::new().route("/payments", post(routes::payment::create_payment));
    if state.config.admin_token.is_some() {
        let admin = Router::new()
            .route(
                "/admin/rate-limit/{subject}",
                get(routes::admin::rate_limit_usage).delete(routes::admin::reset_rate_limit),
            )
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), admin_auth));
        admitted = admitted.merge(admin);
    }
    let admitted = admitted.layer(axum::middleware::from_fn_with_state(
        state.admission.clone(),
        admission,
    ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(admitted)
        .layer(axum::middleware::from_fn(log_errors))
        .with_state(state)
}
