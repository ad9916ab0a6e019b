//! Gateway server: wires registry, broker and orchestrator behind axum

use crate::routes;
use axum::routing::{get, post};
use axum::Router;
use intercom_broker::MessageBroker;
use intercom_core::IntercomConfig;
use intercom_orchestrator::TaskOrchestrator;
use intercom_registry::{spawn_reaper, ServiceRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Topic carrying `registered` / `deregistered` membership events.
pub const REGISTRY_TOPIC: &str = "registry";

/// Shared state for all handlers.
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub broker: MessageBroker,
    pub orchestrator: TaskOrchestrator,
    pub config: IntercomConfig,
    pub started_at: Instant,
}

impl AppState {
    /// Build the three cores from config, restoring task state from the
    /// snapshot file if one is configured. Must run inside a Tokio runtime.
    pub fn from_config(config: IntercomConfig) -> intercom_core::Result<Self> {
        let registry = Arc::new(ServiceRegistry::new(&config.registry));
        let broker = MessageBroker::new(config.broker.clone());
        let orchestrator = TaskOrchestrator::from_config(registry.clone(), &config.orchestrator)?;
        Ok(Self {
            registry,
            broker,
            orchestrator,
            config,
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/services", get(routes::list_services).post(routes::register))
        .route("/services/:name", get(routes::discover))
        .route("/services/:name/:id", axum::routing::delete(routes::deregister))
        .route("/services/:name/:id/heartbeat", post(routes::heartbeat))
        .route("/publish", post(routes::publish))
        .route("/broadcast", post(routes::publish))
        .route("/topics", get(routes::topics))
        .route("/topics/:topic/ws", get(routes::topic_ws))
        .route("/tasks", get(routes::list_tasks).post(routes::assign_task))
        .route("/tasks/:id", get(routes::get_task))
        .route("/tasks/:id/complete", post(routes::complete_task))
        .route("/tasks/:id/fail", post(routes::fail_task))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Serve until `shutdown` fires, then stop the reaper and the broker workers.
pub async fn start_gateway(config: IntercomConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port)
        .parse()?;
    let reap_interval = config.registry.reap_interval();
    let state = Arc::new(AppState::from_config(config)?);

    let reaper = reap_interval
        .map(|interval| spawn_reaper(state.registry.clone(), interval, shutdown.child_token()));

    info!("Intercom Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  Topic stream: ws://{}/topics/{{topic}}/ws", bind_addr);
    info!(
        "  Staleness window: {}s",
        state.config.registry.staleness_window_secs
    );
    match &state.config.orchestrator.snapshot_path {
        Some(path) => info!("  Task snapshots: {}", path.display()),
        None => info!("  Task snapshots: disabled"),
    }

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    info!("Gateway stopping");
    shutdown.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    state.broker.shutdown().await;
    Ok(())
}
