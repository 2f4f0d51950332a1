use super::types::{
    ceil_secs, ConsumePolicy, RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitingConfig,
};
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One fixed window of quota for a key
#[derive(Debug)]
struct Window {
    started_at: Instant,
    remaining: u32,
    /// Bumped on each reset so late refunds can tell windows apart
    id: u64,
}

#[derive(Debug)]
pub struct Bucket {
    /// Window length last enforced on this bucket, in milliseconds; drives idle expiry
    window_ms: AtomicU64,
    state: Mutex<Window>,
}

impl Bucket {
    fn new(limit: &RateLimitConfig) -> Self {
        Self {
            window_ms: AtomicU64::new(limit.window().as_millis() as u64),
            state: Mutex::new(Window {
                started_at: Instant::now(),
                remaining: limit.capacity,
                id: 0,
            }),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.load(Ordering::Relaxed))
    }

    /// Record the window now enforced; true if it differs from the previous one
    fn set_window(&self, window: Duration) -> bool {
        let ms = window.as_millis() as u64;
        self.window_ms.swap(ms, Ordering::Relaxed) != ms
    }
}

/// Evict a bucket once it has sat unread for a full window
struct IdleExpiry;

impl Expiry<RateLimitKey, Arc<Bucket>> for IdleExpiry {
    fn expire_after_create(
        &self,
        _key: &RateLimitKey,
        value: &Arc<Bucket>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.window())
    }

    fn expire_after_update(
        &self,
        _key: &RateLimitKey,
        value: &Arc<Bucket>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.window())
    }

    fn expire_after_read(
        &self,
        _key: &RateLimitKey,
        value: &Arc<Bucket>,
        _read_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.window())
    }
}

/// A spent token that may still be handed back
#[derive(Debug)]
pub struct Reservation {
    bucket: Arc<Bucket>,
    window_id: u64,
    capacity: u32,
}

impl Reservation {
    /// Return the token, unless its window has already rolled over
    pub fn refund(self) -> bool {
        let mut window = self.bucket.state.lock();
        if window.id != self.window_id || window.remaining >= self.capacity {
            return false;
        }
        window.remaining += 1;
        true
    }
}

/// In-memory fixed-window rate limiter
///
/// Buckets are created on first use and reset lazily when a request arrives
/// after the window has elapsed. Each bucket has its own lock, so callers on
/// different keys never contend.
pub struct LocalRateLimiter {
    buckets: Cache<RateLimitKey, Arc<Bucket>>,
    policy: ConsumePolicy,
}

impl LocalRateLimiter {
    /// Create a new local rate limiter
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            buckets: Cache::builder()
                .max_capacity(config.max_buckets)
                .expire_after(IdleExpiry)
                .build(),
            policy: config.consume_on,
        }
    }

    /// Take one token from `key`'s bucket if any are left
    pub fn check_rate_limit(&self, key: &RateLimitKey, limit: &RateLimitConfig) -> RateLimitResult {
        let bucket = self
            .buckets
            .get_with(key.clone(), || Arc::new(Bucket::new(limit)));

        let length = limit.window();
        if bucket.set_window(length) {
            // window changed on reload: re-insert so idle expiry follows the new length
            self.buckets.insert(key.clone(), Arc::clone(&bucket));
        }

        let now = Instant::now();
        let mut window = bucket.state.lock();

        if now >= window.started_at + length {
            window.started_at = now;
            window.remaining = limit.capacity;
            window.id += 1;
        }
        // the route's capacity may have shrunk on reload
        window.remaining = window.remaining.min(limit.capacity);

        let reset_in = (window.started_at + length).saturating_duration_since(now);

        if window.remaining == 0 {
            warn!(key = %key, retry_after_ms = reset_in.as_millis() as u64, "Rate limit exceeded");
            return RateLimitResult::denied(limit.capacity, ceil_secs(reset_in));
        }

        window.remaining -= 1;
        debug!(key = %key, remaining = window.remaining, "Rate limit check passed");

        let mut result =
            RateLimitResult::allowed(window.remaining, limit.capacity, ceil_secs(reset_in));
        if self.policy == ConsumePolicy::Completion {
            result.reservation = Some(Reservation {
                bucket: Arc::clone(&bucket),
                window_id: window.id,
                capacity: limit.capacity,
            });
        }
        result
    }

    /// Get the number of live buckets (for monitoring)
    pub fn active_buckets(&self) -> u64 {
        self.buckets.run_pending_tasks();
        self.buckets.entry_count()
    }
}
