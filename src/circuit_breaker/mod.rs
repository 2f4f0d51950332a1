//! Per-backend circuit breaking
//!
//! Each backend id owns one [`CircuitBreaker`]: `Closed` while calls succeed,
//! `Open` once consecutive failures or the rolling failure ratio crosses its
//! threshold, `HalfOpen` after the cooldown while a limited number of probes
//! decide whether to close again or reopen.

pub mod breaker;
pub mod service;
pub mod types;

pub use breaker::{CallPermit, CircuitBreaker, TransitionObserver};
pub use service::CircuitBreakerService;
pub use types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, Transition};
