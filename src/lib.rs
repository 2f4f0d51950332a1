pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod hotreload;
pub mod loadbalancer;
pub mod metrics;
pub mod observability;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod tls;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::hotreload::{reload_handler, HotReloadService, ReloadableRoutes};
use crate::circuit_breaker::CircuitBreakerMetrics;
use crate::loadbalancer::backend::{Backend, BackendState};
use crate::metrics::metrics_handler;
use crate::observability::{make_request_span, request_id_middleware, RequestIdHeader};
use crate::proxy::{proxy_handler, GatewayState};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use axum_server::Handle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub backends: BTreeMap<String, BackendHealth>,
}

/// Breaker-derived view of one backend
#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub state: BackendState,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    pub seconds_in_state: u64,
    #[serde(flatten)]
    pub counters: CircuitBreakerMetrics,
}

impl BackendHealth {
    fn of(backend: &Backend) -> Self {
        Self {
            state: backend.state(),
            consecutive_failures: backend.consecutive_failures(),
            in_flight: backend.in_flight(),
            seconds_in_state: backend.last_state_change().elapsed().as_secs(),
            counters: backend.breaker().metrics(),
        }
    }
}

/// Liveness plus the breaker-derived state of every backend
pub async fn health_handler(State(routes): State<ReloadableRoutes>) -> Json<HealthReport> {
    let table = routes.snapshot().await;
    let backends = table
        .backends()
        .iter()
        .map(|backend| (backend.id().to_string(), BackendHealth::of(backend)))
        .collect();

    Json(HealthReport {
        status: "ok",
        backends,
    })
}

/// Assemble the HTTP application
///
/// Everything that is not a built-in endpoint goes through the proxy.
pub fn build_app(state: GatewayState, config: &GatewayConfig) -> Router {
    let request_id_header = RequestIdHeader(state.settings.request_id_header.clone());

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    if config.admin.reload_endpoint {
        app = app.route("/admin/reload", post(reload_handler));
    }

    app.fallback(proxy_handler)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            request_id_header,
            request_id_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
}

/// Initialize the gateway server
///
/// Serves until Ctrl-C, then drains in-flight requests.
pub async fn init_gateway(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    info!("Starting API Gateway");

    let state = GatewayState::from_config(&config, config_path)?;
    let table = state.routes.snapshot().await;
    if table.is_empty() || table.backends().is_empty() {
        warn!("No routes configured, every proxied request will be answered with 404");
    }
    info!(
        routes = table.len(),
        backends = table.backends().len(),
        "Route table loaded"
    );

    if config.hot_reload.enabled {
        HotReloadService::new(Arc::clone(&state.reloader), config.hot_reload.debounce_ms)
            .start()?;
    }

    #[cfg(unix)]
    crate::hotreload::spawn_sighup_listener(Arc::clone(&state.reloader))?;

    let app = build_app(state, &config);

    let addr: SocketAddr = config.server.bind_address().parse().map_err(|e| {
        GatewayError::Config(format!(
            "Invalid bind address {}: {}",
            config.server.bind_address(),
            e
        ))
    })?;

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match &config.tls {
        Some(tls) => {
            let rustls = crate::tls::rustls_config(tls)?;
            info!(%addr, "Gateway listening with TLS");
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            info!(%addr, "Gateway listening");
            axum_server::bind(addr).handle(handle).serve(service).await?;
        }
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received, draining connections");
    handle.graceful_shutdown(Some(Duration::from_secs(30)));
}
