use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing probe requests
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// A state change reported back to the caller that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failure ratio over the rolling window that opens the circuit
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Samples required in the rolling window before the ratio is considered
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    /// Number of most recent calls kept in the rolling window
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Time spent open before probing, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Probe requests allowed in flight while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,

    /// Successful probes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_window_size() -> u32 {
    20
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_calls: default_minimum_calls(),
            window_size: default_window_size(),
            cooldown_ms: default_cooldown_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0
            || self.half_open_max_probes == 0
            || self.success_threshold == 0
            || self.window_size == 0
        {
            return Err(GatewayError::Config(
                "circuit_breaker thresholds and window_size must be > 0".to_string(),
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_rate_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.minimum_calls > self.window_size {
            return Err(GatewayError::Config(
                "circuit_breaker.minimum_calls cannot exceed window_size".to_string(),
            ));
        }
        if self.success_threshold > self.half_open_max_probes {
            return Err(GatewayError::Config(
                "circuit_breaker.success_threshold cannot exceed half_open_max_probes"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted through the breaker
    pub total_requests: u64,
    /// Number of successful requests
    pub successful_requests: u64,
    /// Number of failed requests
    pub failed_requests: u64,
    /// Number of requests rejected (circuit open)
    pub rejected_requests: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
}
