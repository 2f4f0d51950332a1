use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use tracing::{field, info, info_span, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound request id that is reused rather than replaced
const MAX_REQUEST_ID_LEN: usize = 128;

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "microgate=info,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

/// Initialize the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| GatewayError::Config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let result = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    result.map_err(|e| GatewayError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    info!(format = ?config.format, "Tracing initialized");
    Ok(())
}

/// Request ID extension type
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Name of the correlation header, shared with the request-id middleware
#[derive(Debug, Clone)]
pub struct RequestIdHeader(pub HeaderName);

impl Default for RequestIdHeader {
    fn default() -> Self {
        Self(HeaderName::from_static(REQUEST_ID_HEADER))
    }
}

/// Root span for one request, with `request_id` left for the middleware to fill in
pub fn make_request_span(req: &Request) -> Span {
    info_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        request_id = field::Empty,
    )
}

/// Middleware to add request ID to requests
///
/// A usable inbound id is kept; otherwise a v4 UUID is generated. The id is
/// stored in request extensions and echoed on the response.
pub async fn request_id_middleware(
    State(header): State<RequestIdHeader>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(&header.0)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= MAX_REQUEST_ID_LEN)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", request_id.as_str());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(header.0, value);
    }

    response
}
