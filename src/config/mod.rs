use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{GatewayError, Result};
use crate::hotreload::HotReloadConfig;
use crate::loadbalancer::backend::BackendConfig;
use crate::observability::LoggingConfig;
use crate::rate_limit::types::{RateLimitConfig, RateLimitingConfig};
use crate::tls::TlsConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `MICROGATE_SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "MICROGATE";

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS termination (plain HTTP when absent)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Authentication configuration
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Backend instances, referenced by id from routes
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Thresholds shared by every backend's circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiting policy
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Route table reload on file change
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
    /// Admin endpoints
    #[serde(default)]
    pub admin: AdminConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default backend call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Largest request body forwarded to a backend
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Header carrying the correlation id
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

/// Route configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Path prefix (e.g., "/api/v1/users"); longest matching prefix wins
    pub prefix: String,
    /// Backend ids serving this route
    pub backends: Vec<String>,
    /// Whether a valid bearer token is required
    #[serde(default)]
    pub auth_required: bool,
    /// Caller must hold at least one of these roles (empty means any)
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// Per-caller quota on this route
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Backend call timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether to strip the prefix when forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    /// Route description
    #[serde(default)]
    pub description: String,
}

/// Global authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// JWT configuration
    pub jwt: Option<JwtConfig>,
    /// Replace `x-caller-*` headers with the verified identity before forwarding
    #[serde(default = "default_true")]
    pub forward_identity: bool,
}

/// JWT authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Algorithm to use (HS*, RS* or ES*)
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// Shared secret for HS* algorithms
    #[serde(default)]
    pub secret: Option<SecretString>,
    /// File holding the shared secret, used when `secret` is absent
    #[serde(default)]
    pub secret_file: Option<String>,
    /// PEM public key file for RS*/ES* algorithms
    #[serde(default)]
    pub public_key_file: Option<String>,
    /// Issuer to validate
    #[serde(default)]
    pub issuer: Option<String>,
    /// Audience to validate
    #[serde(default)]
    pub audience: Option<String>,
    /// Tolerated clock drift when checking `exp` and `nbf`
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

/// Admin surface configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Expose `POST /admin/reload`
    #[serde(default)]
    pub reload_endpoint: bool,
}

fn default_true() -> bool {
    true
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_clock_skew_secs() -> u64 {
    5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            request_id_header: default_request_id_header(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, with `MICROGATE_*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                GatewayError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.request_id_header.is_empty()
            || http::HeaderName::from_bytes(self.server.request_id_header.as_bytes()).is_err()
        {
            return Err(GatewayError::Config(format!(
                "Invalid request id header name: '{}'",
                self.server.request_id_header
            )));
        }

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate backend id: {}",
                    backend.id
                )));
            }
        }

        let jwt_configured = self.auth.as_ref().is_some_and(|a| a.jwt.is_some());
        let mut prefixes = HashSet::new();

        for route in &self.routes {
            if route.prefix.is_empty() || !route.prefix.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "Route prefix must start with '/': '{}'",
                    route.prefix
                )));
            }

            if !prefixes.insert(normalize_prefix(&route.prefix)) {
                return Err(GatewayError::Config(format!(
                    "Duplicate route prefix: {}",
                    route.prefix
                )));
            }

            if route.backends.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Route {} has no backends",
                    route.prefix
                )));
            }

            for id in &route.backends {
                if !backend_ids.contains(id.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "Route {} references unknown backend '{}'",
                        route.prefix, id
                    )));
                }
            }

            if (route.auth_required || !route.required_roles.is_empty()) && !jwt_configured {
                return Err(GatewayError::Config(format!(
                    "Route {} requires authentication but no auth.jwt section is configured",
                    route.prefix
                )));
            }

            if let Some(limit) = &route.rate_limit {
                limit.validate().map_err(|e| {
                    GatewayError::Config(format!("Route {}: {}", route.prefix, e))
                })?;
            }

            if route.timeout_ms == Some(0) {
                return Err(GatewayError::Config(format!(
                    "Route {} timeout must be > 0",
                    route.prefix
                )));
            }
        }

        if self.server.timeout_ms == 0 {
            return Err(GatewayError::Config(
                "server.timeout_ms must be > 0".to_string(),
            ));
        }

        self.circuit_breaker.validate()?;

        if let Some(tls) = &self.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                return Err(GatewayError::Config(
                    "tls.cert_path and tls.key_path are required".to_string(),
                ));
            }
        }

        if let Some(jwt) = self.auth.as_ref().and_then(|a| a.jwt.as_ref()) {
            if jwt.secret.is_none() && jwt.secret_file.is_none() && jwt.public_key_file.is_none()
            {
                return Err(GatewayError::Config(
                    "auth.jwt needs one of secret, secret_file or public_key_file".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: None,
            auth: None,
            backends: vec![],
            routes: vec![],
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            hot_reload: HotReloadConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Strip a trailing `/*` or `/` so `/api/*`, `/api/` and `/api` are the same prefix
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('*').trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
