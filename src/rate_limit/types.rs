use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// When a request's token counts as spent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumePolicy {
    /// Spent on admission, never refunded
    #[default]
    Admission,
    /// Refunded when the backend call fails, if its window is still current
    Completion,
}

/// Gateway-wide rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub consume_on: ConsumePolicy,
    /// Upper bound on live buckets
    #[serde(default = "default_max_buckets")]
    pub max_buckets: u64,
}

fn default_max_buckets() -> u64 {
    1_000_000
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            consume_on: ConsumePolicy::default(),
            max_buckets: default_max_buckets(),
        }
    }
}

/// Longest accepted quota window: one year
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Per-route quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per window
    pub capacity: u32,
    /// Time window for the limit (in seconds)
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// Get the window as a Duration, clamped to [`MAX_WINDOW_SECS`]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.min(MAX_WINDOW_SECS))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("rate_limit.capacity must be > 0".to_string());
        }
        if self.window_secs == 0 {
            return Err("rate_limit.window_secs must be > 0".to_string());
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(format!(
                "rate_limit.window_secs must be <= {}",
                MAX_WINDOW_SECS
            ));
        }
        Ok(())
    }
}

/// Who a bucket belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// Verified token subject
    Subject(String),
    /// Anonymous caller, keyed by source address
    Address(IpAddr),
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Subject(sub) => write!(f, "sub:{}", sub),
            Caller::Address(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// Bucket key: one quota per caller per route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub caller: Caller,
    pub route: String,
}

impl RateLimitKey {
    pub fn new(caller: Caller, route: impl Into<String>) -> Self {
        Self {
            caller,
            route: route.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.caller, self.route)
    }
}

/// Rate limit result
#[derive(Debug)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Total limit
    pub limit: u32,
    /// When the window resets (seconds from now, rounded up)
    pub reset_after: u64,
    /// Retry after duration (for 429 responses)
    pub retry_after: Option<u64>,
    /// Held under the completion policy so a failed call can give its token back
    pub reservation: Option<super::local::Reservation>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(remaining: u32, limit: u32, reset_after: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_after,
            retry_after: None,
            reservation: None,
        }
    }

    /// Create a denied result
    pub fn denied(limit: u32, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_after: retry_after,
            retry_after: Some(retry_after),
            reservation: None,
        }
    }
}

/// Whole seconds, rounded up, never below one
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}
