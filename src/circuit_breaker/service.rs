use super::breaker::{CallPermit, CircuitBreaker, TransitionObserver};
use super::types::{CircuitBreakerConfig, CircuitState};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Circuit breakers for every backend, keyed by backend id
///
/// Breakers outlive route table reloads: a backend keeping its id keeps its
/// breaker state.
#[derive(Clone)]
pub struct CircuitBreakerService {
    /// Circuit breakers per backend
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    /// Default configuration
    config: CircuitBreakerConfig,
    observer: Option<Arc<dyn TransitionObserver>>,
}

impl CircuitBreakerService {
    /// Create a new circuit breaker service
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
            observer: None,
        }
    }

    /// Report every breaker transition to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get or create the circuit breaker for a backend
    pub fn breaker(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend) {
            return existing.clone();
        }

        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                debug!(backend = backend, "Creating new circuit breaker");
                Arc::new(CircuitBreaker::with_observer(
                    backend.to_string(),
                    self.config.clone(),
                    self.observer.clone(),
                ))
            })
            .clone()
    }

    /// Check whether a call may go to `backend`
    pub fn check(&self, backend: &str) -> Option<CallPermit> {
        self.breaker(backend).try_acquire()
    }

    /// Get the state of a circuit breaker for a backend
    pub fn state(&self, backend: &str) -> CircuitState {
        self.breakers
            .get(backend)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Get all backend names with circuit breakers
    pub fn backends(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop breakers for backends no longer configured
    pub fn retain(&self, live: &HashSet<String>) {
        self.breakers.retain(|id, _| {
            let keep = live.contains(id);
            if !keep {
                debug!(backend = %id, "Removing circuit breaker for retired backend");
            }
            keep
        });
    }
}
