use crate::circuit_breaker::CircuitBreakerService;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::MetricsService;
use crate::router::RouteTable;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

/// Hot reload configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct HotReloadConfig {
    /// Watch the configuration file for changes
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Debounce delay in milliseconds (to avoid reloading multiple times for rapid changes)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_enabled() -> bool {
    false
}

fn default_debounce_ms() -> u64 {
    1000 // 1 second
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// The active route table
///
/// Each request takes one snapshot and finishes against it; a reload swaps in
/// a new table without touching requests already in flight.
#[derive(Clone)]
pub struct ReloadableRoutes {
    inner: Arc<RwLock<Arc<RouteTable>>>,
}

impl ReloadableRoutes {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    /// Current table
    pub async fn snapshot(&self) -> Arc<RouteTable> {
        self.inner.read().await.clone()
    }

    /// Replace the table, returning the previous one
    pub async fn swap(&self, table: RouteTable) -> Arc<RouteTable> {
        let mut current = self.inner.write().await;
        std::mem::replace(&mut *current, Arc::new(table))
    }
}

/// What a successful reload installed
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub routes: usize,
    pub backends: usize,
}

/// Rebuilds and swaps the route table
///
/// Only routes, backends, rate limits and timeouts are reloadable. Listener,
/// TLS, auth keys and breaker thresholds keep their startup values.
pub struct RouteReloader {
    config_path: Option<PathBuf>,
    routes: ReloadableRoutes,
    breakers: CircuitBreakerService,
    metrics: MetricsService,
    /// Serializes reloads so two triggers cannot interleave build and swap
    in_progress: Mutex<()>,
}

impl RouteReloader {
    pub fn new(
        config_path: Option<PathBuf>,
        routes: ReloadableRoutes,
        breakers: CircuitBreakerService,
        metrics: MetricsService,
    ) -> Self {
        Self {
            config_path,
            routes,
            breakers,
            metrics,
            in_progress: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Re-read the configuration file and apply it
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let result = match &self.config_path {
            Some(path) => {
                info!(path = %path.display(), "Reloading route table");
                match GatewayConfig::from_file(path) {
                    Ok(config) => self.install(&config).await,
                    Err(e) => Err(e),
                }
            }
            None => Err(GatewayError::Config(
                "Gateway was started without a configuration file".to_string(),
            )),
        };
        self.finish(result)
    }

    /// Apply an already loaded configuration
    pub async fn apply(&self, config: &GatewayConfig) -> Result<ReloadSummary> {
        let result = self.install(config).await;
        self.finish(result)
    }

    async fn install(&self, config: &GatewayConfig) -> Result<ReloadSummary> {
        config.validate()?;

        let _guard = self.in_progress.lock().await;
        let table = RouteTable::build(config, &self.breakers)?;

        for backend in table.backends().iter() {
            self.metrics
                .record_circuit_state(backend.id(), backend.breaker().state());
        }

        let summary = ReloadSummary {
            routes: table.len(),
            backends: table.backends().len(),
        };
        self.routes.swap(table).await;

        let live: HashSet<String> = config.backends.iter().map(|b| b.id.clone()).collect();
        self.breakers.retain(&live);

        Ok(summary)
    }

    fn finish(&self, result: Result<ReloadSummary>) -> Result<ReloadSummary> {
        self.metrics.record_reload(result.is_ok());
        match &result {
            Ok(summary) => info!(
                routes = summary.routes,
                backends = summary.backends,
                "Route table reloaded"
            ),
            Err(e) => error!(error = %e, "Route table reload failed, keeping previous table"),
        }
        result
    }
}

/// Hot reload service that watches for configuration file changes
pub struct HotReloadService {
    reloader: Arc<RouteReloader>,
    debounce_duration: Duration,
}

impl HotReloadService {
    /// Create a new hot reload service
    pub fn new(reloader: Arc<RouteReloader>, debounce_ms: u64) -> Self {
        Self {
            reloader,
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Start watching the configuration file for changes
    ///
    /// The parent directory is watched so that editors replacing the file by
    /// rename are still noticed.
    pub fn start(self) -> Result<()> {
        let config_path = self
            .reloader
            .config_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                GatewayError::Config("Hot reload needs a configuration file".to_string())
            })?;
        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, mut rx) = mpsc::channel(100);

        // Create a watcher
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let relevant = matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                GatewayError::Internal(format!("Failed to watch config directory: {}", e))
            })?;

        info!(
            path = %config_path.display(),
            debounce_ms = self.debounce_duration.as_millis() as u64,
            "Hot reload watcher started"
        );

        tokio::spawn(async move {
            // Keep watcher alive for as long as events are consumed
            let _watcher = watcher;

            while let Some(event) = rx.recv().await {
                debug!("File change event detected: {:?}", event.kind);

                // Let a burst of writes settle, then reload once
                tokio::time::sleep(self.debounce_duration).await;
                while rx.try_recv().is_ok() {}

                let _ = self.reloader.reload().await;
            }
        });

        Ok(())
    }
}

/// Reload on SIGHUP
#[cfg(unix)]
pub fn spawn_sighup_listener(reloader: Arc<RouteReloader>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received");
            let _ = reloader.reload().await;
        }
    });
    Ok(())
}

/// `POST /admin/reload`
pub async fn reload_handler(State(reloader): State<Arc<RouteReloader>>) -> Response {
    match reloader.reload().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "reloaded", "routes": summary.routes, "backends": summary.backends })),
        )
            .into_response(),
        // Details (paths, addresses) stay in the log written by `finish`
        Err(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "status": "failed",
                "error": {
                    "code": "ReloadFailed",
                    "message": "Configuration reload failed, see gateway logs",
                },
            })),
        )
            .into_response(),
    }
}
