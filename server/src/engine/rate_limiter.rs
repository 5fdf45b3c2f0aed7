use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Shape of a token bucket: `burst` actions up front, `sustained` per second
/// afterwards, and a full refill once the bucket has been idle for `cooldown`
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleParams {
    pub burst: f64,
    pub sustained: f64,
    pub cooldown: f64,
}

impl ThrottleParams {
    pub const fn new(burst: f64, sustained: f64) -> Self {
        Self {
            burst,
            sustained,
            cooldown: burst / sustained,
        }
    }

    /// Milliseconds between sustained actions.
    pub fn interval_ms(&self) -> u64 {
        if self.sustained > 0.0 {
            (1000.0 / self.sustained) as u64
        } else {
            1000
        }
    }
}

/// Queue limits for ordinary members.
pub const QUEUE_LIMIT: ThrottleParams = ThrottleParams::new(3.0, 1.0);
/// Queue limits for moderators and the leader.
pub const QUEUE_LIMIT_PRIVILEGED: ThrottleParams = ThrottleParams::new(10.0, 2.0);

/// A single token bucket. Parameters are supplied on every call because room
/// options can change them at any time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: Option<f64>,
    last_refill: Instant,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBucket {
    pub fn new() -> Self {
        Self {
            tokens: None,
            last_refill: Instant::now(),
        }
    }

    /// Take one token. Returns true when the action must be throttled.
    pub fn throttle(&mut self, params: &ThrottleParams) -> bool {
        self.throttle_at(params, Instant::now())
    }

    pub fn throttle_at(&mut self, params: &ThrottleParams, now: Instant) -> bool {
        let burst = params.burst.max(1.0);
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        let tokens = match self.tokens {
            None => burst,
            Some(_) if elapsed >= params.cooldown => burst,
            Some(t) => (t + elapsed * params.sustained.max(0.0)).min(burst),
        };
        self.last_refill = now;

        if tokens >= 1.0 {
            self.tokens = Some(tokens - 1.0);
            false
        } else {
            self.tokens = Some(tokens);
            true
        }
    }
}

/// Token buckets keyed by string (address, name, etc.).
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    params: ThrottleParams,
}

impl RateLimiter {
    /// Create a rate limiter.
    /// - `max_tokens`: burst capacity
    /// - `per_seconds`: refill one token every N seconds
    pub fn new(max_tokens: u32, per_seconds: f64) -> Self {
        let sustained = 1.0 / per_seconds;
        Self {
            buckets: Mutex::new(HashMap::new()),
            params: ThrottleParams {
                burst: max_tokens as f64,
                sustained,
                cooldown: f64::INFINITY,
            },
        }
    }

    /// Check if an action is allowed for the given key. Returns true if allowed.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_default();
        !bucket.throttle(&self.params)
    }

    /// Remove stale entries older than the given duration.
    pub fn cleanup(&self, older_than: Duration) {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < older_than);
    }
}
