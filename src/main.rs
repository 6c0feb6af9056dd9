use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use admission::{
    AppState, app,
    config::{Config, StoreBackend},
    store::{LocalStore, RedisStore, RedisStoreConfig, Store, SweeperHandle},
};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // backing store
    let mut sweeper: Option<SweeperHandle> = None;
    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Memory => {
            let local = LocalStore::new();
            sweeper = Some(local.start_sweeper(config.sweep_interval()));
            tracing::info!("Using in-process store");
            Arc::new(local)
        }
        StoreBackend::Redis => {
            let url = config.redis_url.clone().unwrap_or_default();
            let redis = RedisStore::connect(
                &url,
                RedisStoreConfig {
                    key_prefix: config.redis_key_prefix.clone(),
                },
            )
            .await
            .expect("Failed to connect to Redis");
            tracing::info!("Using Redis store");
            Arc::new(redis)
        }
    };

    let state = AppState::new(config.clone(), store);
    let router = app(state);

    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down");
    })
    .await
    .expect("Failed to start server");

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }
}
