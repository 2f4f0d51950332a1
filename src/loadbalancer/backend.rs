use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerService, CircuitState};
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// Backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable identifier, referenced by routes and used as the breaker key
    pub id: String,
    /// Base URL (e.g., "http://auth-1.internal:8080")
    pub address: String,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(GatewayError::Config("Backend id cannot be empty".to_string()));
        }
        parse_address(&self.address).map(|_| ())
    }
}

fn parse_address(address: &str) -> Result<Url> {
    let url = Url::parse(address).map_err(|e| {
        GatewayError::Config(format!("Invalid backend address '{}': {}", address, e))
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(GatewayError::Config(format!(
            "Backend address must be an absolute http:// or https:// URL: '{}'",
            address
        )));
    }

    Ok(url)
}

/// Health of a backend as seen through its circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Healthy,
    Unhealthy,
    Recovering,
}

impl From<CircuitState> for BackendState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => BackendState::Healthy,
            CircuitState::Open => BackendState::Unhealthy,
            CircuitState::HalfOpen => BackendState::Recovering,
        }
    }
}

/// One upstream instance
#[derive(Debug)]
pub struct Backend {
    id: String,
    address: Url,
    breaker: Arc<CircuitBreaker>,
    in_flight: AtomicUsize,
}

impl Backend {
    pub fn new(config: &BackendConfig, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            address: parse_address(&config.address)?,
            breaker,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn state(&self) -> BackendState {
        self.breaker.state().into()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn last_state_change(&self) -> Instant {
        self.breaker.last_state_change()
    }

    /// Calls currently outstanding against this backend
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count a call as outstanding until the returned guard drops
    pub fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            backend: Arc::clone(self),
        }
    }

    /// Absolute URL for a forwarded path (which must start with '/')
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.address.as_str().trim_end_matches('/'),
            path_and_query
        )
    }
}

/// Decrements the backend's in-flight count on drop
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Backends by id, built alongside each route table snapshot
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    /// Build the registry, attaching each backend to its (possibly pre-existing) breaker
    pub fn build(configs: &[BackendConfig], breakers: &CircuitBreakerService) -> Result<Self> {
        let mut backends = HashMap::with_capacity(configs.len());
        for config in configs {
            let backend = Backend::new(config, breakers.breaker(&config.id))?;
            if backends
                .insert(config.id.clone(), Arc::new(backend))
                .is_some()
            {
                return Err(GatewayError::Config(format!(
                    "Duplicate backend id: {}",
                    config.id
                )));
            }
        }
        Ok(Self { backends })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Backend>> {
        self.backends.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
