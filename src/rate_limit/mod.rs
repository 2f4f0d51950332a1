//! Rate limiting module
//!
//! Per-route quotas enforced per caller with an in-memory fixed window:
//!
//! - Buckets keyed by `(caller, route prefix)`; anonymous callers are keyed by
//!   source address
//! - Lazy window reset on access, idle buckets expire after one window
//! - Token consumed on admission, or refunded on backend failure when the
//!   `completion` policy is selected
//! - Rate limit headers in responses (`X-RateLimit-*`)
//!
//! # Example
//!
//! ```rust
//! use microgate::rate_limit::{Caller, LocalRateLimiter, RateLimitConfig, RateLimitKey, RateLimitingConfig};
//!
//! let limiter = LocalRateLimiter::new(&RateLimitingConfig::default());
//! let quota = RateLimitConfig { capacity: 5, window_secs: 10 };
//! let key = RateLimitKey::new(Caller::Subject("alice".to_string()), "/auth");
//!
//! assert!(limiter.check_rate_limit(&key, &quota).allowed);
//! ```

pub mod local;
pub mod types;

use axum::http::{HeaderMap, HeaderValue};

pub use local::{LocalRateLimiter, Reservation};
pub use types::{
    Caller, ConsumePolicy, RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitingConfig,
};

/// Add rate limit headers to a successful response
pub fn add_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(result.reset_after));
}
