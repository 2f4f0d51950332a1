use crate::auth::AuthService;
use crate::circuit_breaker::CircuitBreakerService;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::hotreload::{ReloadableRoutes, RouteReloader};
use crate::loadbalancer::SelectError;
use crate::metrics::{MetricsService, Outcome, RequestEvent};
use crate::observability::RequestId;
use crate::rate_limit::{add_rate_limit_headers, Caller, LocalRateLimiter, RateLimitKey};
use crate::router::{Route, RouteTable};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRef, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response},
    Extension,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Settings fixed at startup
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Largest request body read before forwarding
    pub max_body_bytes: usize,
    /// Correlation header forwarded to backends
    pub request_id_header: HeaderName,
}

/// Shared state for every request handler
#[derive(Clone, FromRef)]
pub struct GatewayState {
    pub routes: ReloadableRoutes,
    pub reloader: Arc<RouteReloader>,
    pub breakers: CircuitBreakerService,
    pub rate_limiter: Arc<LocalRateLimiter>,
    pub auth: AuthService,
    pub metrics: MetricsService,
    pub client: reqwest::Client,
    pub settings: Arc<ProxySettings>,
}

impl GatewayState {
    /// Build all gateway components from a validated configuration
    pub fn from_config(config: &GatewayConfig, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let metrics = MetricsService::new()?;
        let breakers = CircuitBreakerService::new(config.circuit_breaker.clone())
            .with_observer(Arc::new(metrics.clone()));

        let table = RouteTable::build(config, &breakers)?;
        for backend in table.backends().iter() {
            metrics.record_circuit_state(backend.id(), backend.breaker().state());
        }
        let routes = ReloadableRoutes::new(table);

        let reloader = Arc::new(RouteReloader::new(
            config_path,
            routes.clone(),
            breakers.clone(),
            metrics.clone(),
        ));

        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let request_id_header = HeaderName::from_bytes(
            config.server.request_id_header.as_bytes(),
        )
        .map_err(|e| GatewayError::Config(format!("Invalid request id header: {}", e)))?;

        Ok(Self {
            routes,
            reloader,
            breakers,
            rate_limiter: Arc::new(LocalRateLimiter::new(&config.rate_limiting)),
            auth: AuthService::new(config.auth.as_ref())?,
            metrics,
            client,
            settings: Arc::new(ProxySettings {
                max_body_bytes: config.server.max_body_bytes,
                request_id_header,
            }),
        })
    }
}

/// Route and backend a request reached, for the metrics event
#[derive(Default)]
struct Trace {
    route: Option<String>,
    backend: Option<String>,
}

/// Main proxy handler that forwards requests to backend services
///
/// Every request produces exactly one metrics event, whatever stage it ends at.
pub async fn proxy_handler(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request_id: Option<Extension<RequestId>>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let request_id = request_id.map(|Extension(id)| id.0);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let table = state.routes.snapshot().await;
    let mut trace = Trace::default();

    let result = dispatch(
        &state,
        &table,
        req,
        client_ip,
        request_id.as_deref(),
        &mut trace,
    )
    .await;

    let (outcome, response) = match result {
        Ok(response) => (Outcome::Success, response),
        Err(e) => {
            let outcome = Outcome::from_error(&e);
            warn!(
                request_id = request_id.as_deref().unwrap_or("-"),
                route = trace.route.as_deref().unwrap_or("-"),
                backend = trace.backend.as_deref().unwrap_or("-"),
                error = %e,
                "Request rejected"
            );
            (outcome, e.to_response(request_id.as_deref()))
        }
    };

    let latency = started.elapsed();
    state.metrics.record(&RequestEvent {
        route: trace.route.as_deref(),
        backend: trace.backend.as_deref(),
        outcome,
        latency,
    });

    info!(
        method = %method,
        path = %path,
        client_ip = %client_ip,
        status = response.status().as_u16(),
        outcome = outcome.as_str(),
        latency_ms = latency.as_millis() as u64,
        "Request completed"
    );

    response
}

/// Run the pipeline: match, authenticate, rate limit, select, forward
async fn dispatch(
    state: &GatewayState,
    table: &RouteTable,
    req: Request<Body>,
    client_ip: IpAddr,
    request_id: Option<&str>,
    trace: &mut Trace,
) -> Result<Response<Body>> {
    let route = table.match_route(req.uri().path())?;
    trace.route = Some(route.prefix.clone());

    let identity = state
        .auth
        .authorize(req.headers(), route.auth_required, &route.required_roles)?;

    let mut quota = match &route.rate_limit {
        Some(limit) => {
            let caller = match &identity {
                Some(identity) => Caller::Subject(identity.subject_id.clone()),
                None => Caller::Address(client_ip),
            };
            let key = RateLimitKey::new(caller, route.prefix.clone());
            let result = state.rate_limiter.check_rate_limit(&key, limit);
            if !result.allowed {
                return Err(GatewayError::RateLimited {
                    limit: result.limit,
                    retry_after: result.retry_after.unwrap_or(result.reset_after),
                });
            }
            Some(result)
        }
        None => None,
    };

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, state.settings.max_body_bytes)
        .await
        .map_err(|e| GatewayError::MalformedRequest(format!("unreadable body: {}", e)))?;

    let selected = route.balancer.select_backend().map_err(|e| match e {
        SelectError::AllOpen => GatewayError::CircuitOpen(route.prefix.clone()),
        SelectError::NoHealthyBackend => GatewayError::NoHealthyBackend(route.prefix.clone()),
    })?;
    let backend = Arc::clone(&selected.backend);
    trace.backend = Some(backend.id().to_string());

    let mut headers = forward_headers(
        &parts.headers,
        client_ip,
        request_id,
        &state.settings.request_id_header,
    );
    state
        .auth
        .apply_identity_headers(&mut headers, identity.as_ref());
    let url = backend.url_for(&route.forward_path(parts.uri.path(), parts.uri.query()));

    debug!(
        backend = backend.id(),
        probe = selected.permit.is_probe(),
        healthy_count = route.balancer.healthy_count(),
        total_count = route.balancer.total_count(),
        "Selected backend"
    );

    let sent = {
        let _in_flight = backend.begin_call();
        state.metrics.record_inflight(backend.id(), backend.in_flight());
        let sent = send_request(state, &route, parts.method, &url, headers, body).await;
        state
            .metrics
            .record_inflight(backend.id(), backend.in_flight().saturating_sub(1));
        sent
    };

    let reservation = quota.as_mut().and_then(|q| q.reservation.take());

    match sent {
        Ok(mut response) => {
            selected.permit.record(true);
            if let Some(quota) = &quota {
                add_rate_limit_headers(response.headers_mut(), quota);
            }
            Ok(response)
        }
        Err(e) => {
            selected.permit.record(false);
            if let Some(reservation) = reservation {
                if reservation.refund() {
                    debug!(backend = backend.id(), "Refunded rate limit token after backend failure");
                }
            }
            Err(e)
        }
    }
}

/// Send request to the backend service, mapping failures to gateway errors
async fn send_request(
    state: &GatewayState,
    route: &Route,
    method: axum::http::Method,
    url: &str,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<Response<Body>> {
    // The deadline covers the response head only; the body streams unbounded
    let pending = state
        .client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send();
    let backend_response = tokio::time::timeout(route.timeout, pending)
        .await
        .map_err(|_| GatewayError::BackendTimeout(format!("{} after {:?}", url, route.timeout)))?
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::BackendTimeout(format!("{}: {}", url, e))
            } else {
                GatewayError::BackendError(format!("{}: {}", url, e))
            }
        })?;

    let status = backend_response.status();
    if status.is_server_error() {
        return Err(GatewayError::BackendError(format!(
            "{} returned {}",
            url, status
        )));
    }

    let response_headers = strip_hop_by_hop(backend_response.headers());
    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(backend_response.bytes_stream()))
        .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))?;
    *response.headers_mut() = response_headers;

    Ok(response)
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy `headers` without hop-by-hop fields, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop_header(name) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers for the backend request
///
/// Drops hop-by-hop fields and `Host`, appends the caller to
/// `X-Forwarded-For` and sets the correlation id.
pub fn forward_headers(
    inbound: &HeaderMap,
    client_ip: IpAddr,
    request_id: Option<&str>,
    request_id_header: &HeaderName,
) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);

    let forwarded_for = match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(previous) if !previous.is_empty() => format!("{}, {}", previous, client_ip),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(request_id_header.clone(), id);
    }

    headers
}
