use crate::circuit_breaker::{CircuitState, Transition, TransitionObserver};
use crate::error::{GatewayError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthRejected,
    RateLimited,
    CircuitOpen,
    NoHealthyBackend,
    BackendError,
    Timeout,
    RouteNotFound,
    MalformedRequest,
    InternalError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthRejected => "auth_rejected",
            Outcome::RateLimited => "rate_limited",
            Outcome::CircuitOpen => "circuit_open",
            Outcome::NoHealthyBackend => "no_healthy_backend",
            Outcome::BackendError => "backend_error",
            Outcome::Timeout => "timeout",
            Outcome::RouteNotFound => "route_not_found",
            Outcome::MalformedRequest => "malformed_request",
            Outcome::InternalError => "internal_error",
        }
    }

    pub fn from_error(error: &GatewayError) -> Self {
        match error {
            GatewayError::Auth(_) => Outcome::AuthRejected,
            GatewayError::RateLimited { .. } => Outcome::RateLimited,
            GatewayError::CircuitOpen(_) => Outcome::CircuitOpen,
            GatewayError::NoHealthyBackend(_) => Outcome::NoHealthyBackend,
            GatewayError::BackendTimeout(_) => Outcome::Timeout,
            GatewayError::BackendError(_) => Outcome::BackendError,
            GatewayError::RouteNotFound(_) => Outcome::RouteNotFound,
            GatewayError::MalformedRequest(_) => Outcome::MalformedRequest,
            _ => Outcome::InternalError,
        }
    }
}

/// One finished request, as seen by the dispatcher
#[derive(Debug, Clone, Copy)]
pub struct RequestEvent<'a> {
    /// Matched route prefix, `None` when nothing matched
    pub route: Option<&'a str>,
    /// Backend the call went to, if one was selected
    pub backend: Option<&'a str>,
    pub outcome: Outcome,
    pub latency: Duration,
}

/// Metrics service for collecting and exposing Prometheus metrics
///
/// Owns its recorder instead of installing a global one, so several gateways
/// (and tests) can live in one process.
#[derive(Clone)]
pub struct MetricsService {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new() -> Result<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(LATENCY_BUCKETS)
            .map_err(|e| {
                GatewayError::Internal(format!("Failed to configure metrics recorder: {}", e))
            })?
            .build_recorder();
        let handle = recorder.handle();

        let service = Self {
            recorder: Arc::new(recorder),
            handle,
        };
        service.register_metrics();

        info!("Metrics service initialized successfully");
        Ok(service)
    }

    fn with_recorder<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(self.recorder.as_ref(), f)
    }

    /// Register all metrics with descriptions
    fn register_metrics(&self) {
        self.with_recorder(|| {
            describe_counter!(
                "gateway_requests_total",
                "Total number of requests by route, backend and outcome"
            );
            describe_histogram!(
                "gateway_request_duration_seconds",
                "Request latencies in seconds"
            );
            describe_gauge!(
                "gateway_backend_inflight",
                "Calls currently outstanding against a backend"
            );
            describe_gauge!(
                "gateway_circuit_breaker_state",
                "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
            );
            describe_counter!(
                "gateway_circuit_breaker_transitions_total",
                "Total number of circuit breaker state transitions"
            );
            describe_counter!(
                "gateway_route_table_reloads_total",
                "Route table reload attempts by result"
            );
        });

        debug!("All metrics registered with descriptions");
    }

    /// Record one finished request
    pub fn record(&self, event: &RequestEvent<'_>) {
        let labels = [
            ("route", event.route.unwrap_or("unmatched").to_string()),
            ("backend", event.backend.unwrap_or("none").to_string()),
            ("outcome", event.outcome.as_str().to_string()),
        ];

        self.with_recorder(|| {
            counter!("gateway_requests_total", &labels).increment(1);
            histogram!("gateway_request_duration_seconds", &labels)
                .record(event.latency.as_secs_f64());
        });
    }

    /// Record calls outstanding against a backend
    pub fn record_inflight(&self, backend: &str, count: usize) {
        let labels = [("backend", backend.to_string())];
        self.with_recorder(|| {
            gauge!("gateway_backend_inflight", &labels).set(count as f64);
        });
    }

    /// Record circuit breaker state
    pub fn record_circuit_state(&self, backend: &str, state: CircuitState) {
        let labels = [("backend", backend.to_string())];
        self.with_recorder(|| {
            gauge!("gateway_circuit_breaker_state", &labels).set(state.as_gauge());
        });
    }

    /// Record a route table reload attempt
    pub fn record_reload(&self, success: bool) {
        let labels = [(
            "result",
            if success { "success" } else { "failure" }.to_string(),
        )];
        self.with_recorder(|| {
            counter!("gateway_route_table_reloads_total", &labels).increment(1);
        });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl TransitionObserver for MetricsService {
    fn on_transition(&self, backend: &str, transition: Transition) {
        let labels = [
            ("backend", backend.to_string()),
            ("from", transition.from.to_string()),
            ("to", transition.to.to_string()),
        ];
        self.with_recorder(|| {
            counter!("gateway_circuit_breaker_transitions_total", &labels).increment(1);
        });
        self.record_circuit_state(backend, transition.to);
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}
