pub mod backend;

use crate::circuit_breaker::{CallPermit, CircuitState};
use backend::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Why no backend could be chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// Every backend was refused and at least one circuit is open
    AllOpen,
    /// No backend is configured, or every one is busy probing
    NoHealthyBackend,
}

/// A backend picked for one call, with the breaker admission for it
pub struct Selected {
    pub backend: Arc<Backend>,
    pub permit: CallPermit,
}

/// Round-robin selection across one route's backends
///
/// Starting from the next rotation slot, backends are offered to their circuit
/// breaker in order; the first one admitted wins. Open circuits are skipped,
/// and a circuit whose cooldown has elapsed is admitted as a half-open probe
/// when its turn comes.
#[derive(Debug)]
pub struct LoadBalancer {
    /// Available backends
    backends: Vec<Arc<Backend>>,
    counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a new load balancer
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            counter: AtomicUsize::new(0),
        }
    }

    /// Select a backend for the request
    pub fn select_backend(&self) -> Result<Selected, SelectError> {
        let len = self.backends.len();
        if len == 0 {
            return Err(SelectError::NoHealthyBackend);
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        let mut any_open = false;

        for offset in 0..len {
            let backend = &self.backends[(start + offset) % len];
            match backend.breaker().try_acquire() {
                Some(permit) => {
                    return Ok(Selected {
                        backend: Arc::clone(backend),
                        permit,
                    })
                }
                None => {
                    any_open |= backend.breaker().state() == CircuitState::Open;
                }
            }
        }

        if any_open {
            Err(SelectError::AllOpen)
        } else {
            Err(SelectError::NoHealthyBackend)
        }
    }

    /// Get all backends
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Backends whose circuit is not open
    pub fn healthy_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.breaker().state() != CircuitState::Open)
            .count()
    }

    /// Get total backend count
    pub fn total_count(&self) -> usize {
        self.backends.len()
    }
}
