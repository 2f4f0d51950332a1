use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Reasons a bearer token can be refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Malformed bearer token")]
    MalformedToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Token signature verification failed")]
    InvalidSignature,

    #[error("Token claims were rejected")]
    InvalidClaims,

    #[error("Caller lacks a required role")]
    InsufficientRole,
}

impl AuthError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "MissingToken",
            AuthError::MalformedToken => "MalformedToken",
            AuthError::ExpiredToken => "ExpiredToken",
            AuthError::InvalidSignature => "InvalidSignature",
            AuthError::InvalidClaims => "InvalidClaims",
            AuthError::InsufficientRole => "Forbidden",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InsufficientRole => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Gateway error types
///
/// String payloads carry internal detail for logs only. The rendered response
/// uses [`GatewayError::public_message`], which never includes backend
/// addresses or upstream error text.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Authentication rejected: {0}")]
    Auth(#[from] AuthError),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        limit: u32,
        retry_after: u64,
    },

    #[error("Circuit open for every backend of route {0}")]
    CircuitOpen(String),

    #[error("No healthy backend for route {0}")]
    NoHealthyBackend(String),

    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Tls(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Auth(e) => e.status_code(),
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) | GatewayError::NoHealthyBackend(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "RouteNotFound",
            GatewayError::Auth(e) => e.code(),
            GatewayError::RateLimited { .. } => "RateLimited",
            GatewayError::CircuitOpen(_) => "CircuitOpen",
            GatewayError::NoHealthyBackend(_) => "NoHealthyBackend",
            GatewayError::BackendTimeout(_) => "BackendTimeout",
            GatewayError::BackendError(_) => "BackendError",
            GatewayError::MalformedRequest(_) => "MalformedRequest",
            GatewayError::Config(_)
            | GatewayError::Tls(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => "InternalError",
        }
    }

    /// Caller-facing message
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::RouteNotFound(_) => "No route matches the request path".to_string(),
            GatewayError::Auth(e) => e.to_string(),
            GatewayError::RateLimited { .. } => "Rate limit exceeded".to_string(),
            GatewayError::CircuitOpen(_) => "Service temporarily unavailable".to_string(),
            GatewayError::NoHealthyBackend(_) => "No healthy backend available".to_string(),
            GatewayError::BackendTimeout(_) => "Upstream service timed out".to_string(),
            GatewayError::BackendError(_) => "Upstream service failed".to_string(),
            GatewayError::MalformedRequest(detail) => format!("Malformed request: {}", detail),
            _ => "Internal server error".to_string(),
        }
    }

    /// Retry hint in seconds, for rate-limited requests
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Render the structured error response, tagging it with the request id if known
    pub fn to_response(&self, request_id: Option<&str>) -> Response {
        let status = self.status_code();
        let mut error = json!({
            "code": self.code(),
            "message": self.public_message(),
        });
        if let Some(retry_after) = self.retry_after() {
            error["retry_after"] = json!(retry_after);
        }

        let mut body = json!({
            "error": error,
            "status": status.as_u16(),
        });
        if let Some(id) = request_id {
            body["request_id"] = json!(id);
        }

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited { limit, retry_after } = self {
            let headers = response.headers_mut();
            headers.insert(http::header::RETRY_AFTER, HeaderValue::from(*retry_after));
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            headers.insert("x-ratelimit-reset", HeaderValue::from(*retry_after));
        }

        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}
