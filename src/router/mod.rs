use crate::circuit_breaker::CircuitBreakerService;
use crate::config::{normalize_prefix, GatewayConfig, RouteConfig};
use crate::error::{GatewayError, Result};
use crate::loadbalancer::backend::BackendRegistry;
use crate::loadbalancer::LoadBalancer;
use crate::rate_limit::RateLimitConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Route information
#[derive(Debug)]
pub struct Route {
    /// Normalized prefix, no trailing slash (except the root route "/")
    pub prefix: String,
    /// Round-robin over this route's backends
    pub balancer: LoadBalancer,
    pub auth_required: bool,
    pub required_roles: Vec<String>,
    pub rate_limit: Option<RateLimitConfig>,
    /// Backend call timeout
    pub timeout: Duration,
    /// Whether to strip the prefix when forwarding
    pub strip_prefix: bool,
}

impl Route {
    fn from_config(
        config: &RouteConfig,
        registry: &BackendRegistry,
        default_timeout: Duration,
    ) -> Result<Self> {
        let backends = config
            .backends
            .iter()
            .map(|id| {
                registry.get(id).cloned().ok_or_else(|| {
                    GatewayError::Config(format!(
                        "Route {} references unknown backend '{}'",
                        config.prefix, id
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            prefix: normalize_prefix(&config.prefix),
            balancer: LoadBalancer::new(backends),
            auth_required: config.auth_required,
            required_roles: config.required_roles.clone(),
            rate_limit: config.rate_limit.clone(),
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            strip_prefix: config.strip_prefix,
        })
    }

    /// Whether `path` falls under this route's prefix on a segment boundary
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path to send upstream for an inbound `path` and optional query
    pub fn forward_path(&self, path: &str, query: Option<&str>) -> String {
        let path = if self.strip_prefix && self.prefix != "/" {
            match path.strip_prefix(self.prefix.as_str()) {
                Some("") | None => "/",
                Some(rest) => rest,
            }
        } else {
            path
        };

        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        }
    }
}

/// Immutable routing snapshot
///
/// Routes are kept sorted longest prefix first, so the first match is the most
/// specific one. Reloads build a new table and swap it in whole.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    backends: BackendRegistry,
}

impl RouteTable {
    /// Build a table from validated configuration, attaching backends to their breakers
    pub fn build(config: &GatewayConfig, breakers: &CircuitBreakerService) -> Result<Self> {
        let backends = BackendRegistry::build(&config.backends, breakers)?;
        let default_timeout = config.server.timeout();

        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            let route = Route::from_config(route_config, &backends, default_timeout)?;
            debug!(
                prefix = %route.prefix,
                description = %route_config.description,
                backends = route.balancer.total_count(),
                "Route registered"
            );
            if !seen.insert(route.prefix.clone()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate route prefix: {}",
                    route_config.prefix
                )));
            }
            routes.push(Arc::new(route));
        }

        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        info!(
            routes = routes.len(),
            backends = backends.len(),
            "Route table built"
        );

        Ok(Self { routes, backends })
    }

    /// Match a request path to the route with the longest matching prefix
    pub fn match_route(&self, path: &str) -> Result<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(path.to_string()))
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
