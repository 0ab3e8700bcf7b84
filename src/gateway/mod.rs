//! HTTP gateway: JSON and SSE endpoints over the turn orchestrator.
//!
//! - `GET  /`           : service banner
//! - `GET  /health`     : liveness plus configured model
//! - `POST /reset`      : clear a session
//! - `POST /chat`       : one turn, whole reply as JSON
//! - `POST /chat_stream`: one turn as server-sent events (alias `/chat/stream`)
//! - `GET  /metrics`    : Prometheus exposition

pub mod api;

use crate::agent::TurnOrchestrator;
use crate::config::{Config, GatewayConfig};
use crate::observability::Metrics;
use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Upper bound on the janitor sweep interval.
const MAX_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub model: Arc<str>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(orchestrator: Arc<TurnOrchestrator>) -> Result<Self> {
        let model = Arc::from(orchestrator.settings().completion.model.as_str());
        let metrics = Metrics::new().context("Failed to register gateway metrics")?;
        Ok(Self {
            orchestrator,
            model,
            metrics: Arc::new(metrics),
        })
    }

    fn refresh_session_gauge(&self) {
        self.metrics
            .set_resident_sessions(self.orchestrator.store().session_count());
    }
}

fn cors_layer(allowed_origin: &str) -> Result<CorsLayer> {
    let origin = allowed_origin.trim();
    if origin == "*" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let origin = HeaderValue::from_str(origin)
        .with_context(|| format!("Invalid CORS origin: {origin}"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

/// Build the router with CORS and body-size limits applied.
pub fn build_router(state: AppState, config: &GatewayConfig) -> Result<Router> {
    let router = Router::new()
        .route("/", get(api::handle_root))
        .route("/health", get(api::handle_health))
        .route("/metrics", get(api::handle_metrics))
        .route("/reset", post(api::handle_reset))
        .route("/chat", post(api::handle_chat))
        .route("/chat_stream", post(api::handle_chat_stream))
        .route("/chat/stream", post(api::handle_chat_stream))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(cors_layer(&config.allowed_origin)?)
        .with_state(state);
    Ok(router)
}

fn janitor_interval(idle_ttl: Option<Duration>) -> Duration {
    idle_ttl.map_or(MAX_JANITOR_INTERVAL, |ttl| {
        ttl.clamp(Duration::from_secs(1), MAX_JANITOR_INTERVAL)
    })
}

/// Periodically evict idle sessions and unused lock entries.
fn spawn_janitor(state: AppState, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = state.orchestrator.prune_idle();
            if evicted > 0 {
                tracing::debug!(evicted, "pruned idle sessions");
            }
            state.refresh_session_gauge();
        }
    })
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let orchestrator = TurnOrchestrator::from_config(&config)?;
    let state = AppState::new(orchestrator)?;
    let app = build_router(state.clone(), &config.gateway)?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    let janitor = spawn_janitor(state.clone(), janitor_interval(config.session_limits().idle_ttl));

    tracing::info!(
        addr = %local,
        model = %state.model,
        provider = state.orchestrator.provider_name(),
        window = config.session.history_window,
        "Gateway listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await;

    janitor.abort();
    served.context("Gateway server error")
}
