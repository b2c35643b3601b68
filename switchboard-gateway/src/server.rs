//! # HTTP Server Wiring
//!
//! Builds the process: storage, the three routing singletons (config
//! cache, connection pool, health registry), the usage aggregator, the
//! background tasks, and the axum router with its middleware stack.
//!
//! The routed endpoints (`/v1/chat/completions`, `/v1/messages`) carry no
//! server-side timeout — their lifetime is governed by the per-model
//! budget and streams may legitimately run long. The control endpoints
//! get the configured request timeout.
//!
//! Background tasks (health checker, pool sweeper) observe a shared
//! `watch` stop signal; [`Gateway::shutdown`] flips it and waits for them
//! to park.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::cache::ConfigCache;
use crate::config::Config;
use crate::handlers;
use crate::health::checker::HealthChecker;
use crate::health::HealthRegistry;
use crate::router::RouterContext;
use crate::storage::Store;
use crate::usage::UsageStats;
use switchboard_upstream::ConnectionPool;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub router: RouterContext,
}

/// The assembled server: the axum app plus its background tasks.
pub struct Gateway {
    pub app: Router,
    pub state: AppState,
    stop: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Gateway {
    /// Signal the background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Create the gateway from configuration: open storage, start the
/// background tasks, and assemble the router.
pub async fn create_server(config: Config) -> anyhow::Result<Gateway> {
    let store = Store::connect(&config.database.path).await?;
    let cache = ConfigCache::new(store.clone(), config.cache.ttl);
    let pool = Arc::new(ConnectionPool::new(config.pool.to_pool_config()));
    let health = HealthRegistry::new(store.clone());
    let usage = UsageStats::new(store.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let tasks = vec![
        Arc::clone(&pool).spawn_sweeper(stop_rx.clone()),
        HealthChecker::new(store.clone(), health.clone(), Arc::clone(&pool)).spawn(stop_rx),
    ];

    let control_timeout = config.server.timeout;
    let state = AppState {
        config: Arc::new(config),
        router: RouterContext {
            store,
            cache,
            pool,
            health,
            usage,
        },
    };

    // Routed endpoints: no server-side timeout, bodies stream.
    let routed = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::messages));

    // Control endpoints: small, bounded responses.
    let control = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .layer(TimeoutLayer::new(control_timeout));

    let api = routed.merge(control).layer(axum::middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    let app = Router::new()
        .merge(api)
        .route("/health", get(handlers::health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state.clone());

    Ok(Gateway {
        app,
        state,
        stop: stop_tx,
        tasks,
    })
}
