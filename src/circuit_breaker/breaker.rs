use super::types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, Transition};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receives every state change of every breaker
///
/// Called with the breaker's lock held, so calls for one backend arrive in the
/// order the transitions happened. Implementations must not call back into the
/// breaker.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, backend: &str, transition: Transition);
}

/// Circuit breaker for a single backend
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state
    state: Mutex<State>,
    /// Backend identifier
    backend: String,
    observer: Option<Arc<dyn TransitionObserver>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug)]
struct State {
    /// Current circuit state
    circuit_state: CircuitState,
    /// Bumped on every transition; outcomes from older permits are ignored
    generation: u64,
    /// Number of consecutive failures in closed state
    consecutive_failures: u32,
    /// Most recent outcomes in closed state, `true` for failure
    window: VecDeque<bool>,
    window_failures: u32,
    /// Probes admitted in the current half-open period
    probes_admitted: u32,
    /// Successful probes in the current half-open period
    probe_successes: u32,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    last_state_change: Instant,
    /// Metrics
    metrics: CircuitBreakerMetrics,
}

/// Admission through a breaker. Report the call's result with [`CallPermit::record`];
/// dropping the permit unreported (the call was cancelled) frees its probe slot.
#[must_use = "a permit must be recorded or dropped to release its probe slot"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    done: bool,
}

impl CallPermit {
    /// Whether this call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Feed the call's result back into the breaker
    pub fn record(mut self, success: bool) -> Option<Transition> {
        self.done = true;
        self.breaker
            .on_outcome(self.generation, self.probe, success)
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.done && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(backend: String, config: CircuitBreakerConfig) -> Self {
        Self::with_observer(backend, config, None)
    }

    pub fn with_observer(
        backend: String,
        config: CircuitBreakerConfig,
        observer: Option<Arc<dyn TransitionObserver>>,
    ) -> Self {
        debug!(
            backend = %backend,
            failure_threshold = config.failure_threshold,
            failure_rate_threshold = config.failure_rate_threshold,
            cooldown_ms = config.cooldown_ms,
            "Creating circuit breaker"
        );

        Self {
            state: Mutex::new(State {
                circuit_state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                window: VecDeque::with_capacity(config.window_size as usize),
                window_failures: 0,
                probes_admitted: 0,
                probe_successes: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                metrics: CircuitBreakerMetrics::default(),
            }),
            config,
            backend,
            observer,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Ask to send one call to the backend
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here, and the
    /// caller receives the first probe permit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let mut state = self.state.lock();
        let mut transition = None;

        let probe = match state.circuit_state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);
                if !cooled_down {
                    state.metrics.rejected_requests += 1;
                    return None;
                }
                transition = Some(self.transition(&mut state, CircuitState::HalfOpen));
                true
            }
            CircuitState::HalfOpen => {
                if state.probes_admitted >= self.config.half_open_max_probes {
                    state.metrics.rejected_requests += 1;
                    debug!(backend = %self.backend, "Max half-open probes in flight, rejecting");
                    return None;
                }
                true
            }
        };

        if probe {
            state.probes_admitted += 1;
            debug!(
                backend = %self.backend,
                probes_admitted = state.probes_admitted,
                "Allowing half-open probe request"
            );
        }
        state.metrics.total_requests += 1;

        let permit = CallPermit {
            breaker: Arc::clone(self),
            generation: state.generation,
            probe,
            done: false,
        };
        if let Some(t) = transition {
            self.notify(t);
        }
        Some(permit)
    }

    fn on_outcome(&self, generation: u64, probe: bool, success: bool) -> Option<Transition> {
        let mut state = self.state.lock();

        if generation != state.generation {
            debug!(
                backend = %self.backend,
                success,
                "Ignoring outcome from an earlier breaker state"
            );
            return None;
        }

        if success {
            state.metrics.successful_requests += 1;
        } else {
            state.metrics.failed_requests += 1;
        }

        let transition = match state.circuit_state {
            CircuitState::Closed => {
                self.push_window(&mut state, !success);
                if success {
                    state.consecutive_failures = 0;
                    None
                } else {
                    state.consecutive_failures += 1;
                    if self.should_open(&state) {
                        Some(self.transition(&mut state, CircuitState::Open))
                    } else {
                        None
                    }
                }
            }
            CircuitState::HalfOpen if probe => {
                if success {
                    state.probe_successes += 1;
                    if state.probe_successes >= self.config.success_threshold {
                        Some(self.transition(&mut state, CircuitState::Closed))
                    } else {
                        None
                    }
                } else {
                    warn!(backend = %self.backend, "Half-open probe failed, reopening circuit");
                    Some(self.transition(&mut state, CircuitState::Open))
                }
            }
            _ => None,
        };
        if let Some(t) = transition {
            self.notify(t);
        }
        transition
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.circuit_state == CircuitState::HalfOpen {
            state.probes_admitted = state.probes_admitted.saturating_sub(1);
            debug!(backend = %self.backend, "Cancelled probe released its slot");
        }
    }

    fn push_window(&self, state: &mut State, failure: bool) {
        if state.window.len() >= self.config.window_size as usize {
            if let Some(true) = state.window.pop_front() {
                state.window_failures -= 1;
            }
        }
        state.window.push_back(failure);
        if failure {
            state.window_failures += 1;
        }
    }

    fn should_open(&self, state: &State) -> bool {
        if state.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        let samples = state.window.len();
        samples > 0
            && samples >= self.config.minimum_calls as usize
            && f64::from(state.window_failures) / samples as f64
                >= self.config.failure_rate_threshold
    }

    fn transition(&self, state: &mut State, to: CircuitState) -> Transition {
        let from = state.circuit_state;
        info!(
            backend = %self.backend,
            from = %from,
            to = %to,
            consecutive_failures = state.consecutive_failures,
            "Circuit breaker state change"
        );

        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                state.metrics.circuit_opened_count += 1;
            }
            CircuitState::HalfOpen => {
                state.metrics.circuit_half_opened_count += 1;
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.metrics.circuit_closed_count += 1;
            }
        }

        state.circuit_state = to;
        state.generation += 1;
        state.consecutive_failures = 0;
        state.window.clear();
        state.window_failures = 0;
        state.probes_admitted = 0;
        state.probe_successes = 0;
        state.last_state_change = Instant::now();

        Transition { from, to }
    }

    fn notify(&self, transition: Transition) {
        if let Some(observer) = &self.observer {
            observer.on_transition(&self.backend, transition);
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit_state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn last_state_change(&self) -> Instant {
        self.state.lock().last_state_change
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.state.lock().metrics.clone()
    }
}
