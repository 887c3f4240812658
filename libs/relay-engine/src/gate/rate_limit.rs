//! Per-client token buckets.
//!
//! Buckets live in a capacity-bounded LRU cache keyed by client address.
//! The cache mutex is held only for lookup/creation; the token check
//! locks the single bucket.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Token bucket for one client: refills continuously at `per_second`, holds
/// at most `capacity` tokens, and each admitted request spends one.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket, initially full.
    pub fn new(capacity: u32, per_second: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            per_second,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill), for diagnostics.
    pub fn available(&self) -> f64 {
        let state = self.state.lock();
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.per_second).min(self.capacity)
    }
}

/// Client address → bucket, bounded by `max_clients`.
pub struct RateLimiter {
    buckets: Mutex<LruCache<String, Arc<TokenBucket>>>,
    per_second: f64,
    burst: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: Mutex::new(LruCache::new(cap)),
            per_second: config.per_second,
            burst: config.burst,
        }
    }

    /// Spend one token from `client`'s bucket, creating it on first sight.
    pub fn check(&self, client: &str) -> bool {
        let bucket = {
            let mut buckets = self.buckets.lock();
            buckets
                .get_or_insert(client.to_string(), || {
                    Arc::new(TokenBucket::new(self.burst, self.per_second))
                })
                .clone()
        };
        bucket.try_acquire()
    }

    /// Number of client buckets currently held.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .field("burst", &self.burst)
            .field("tracked_clients", &self.tracked_clients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn limiter(per_second: f64, burst: u32, max_clients: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            per_second,
            burst,
            max_clients,
            trust_forwarded_for: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_exhausted_then_recovers_after_one_period() {
        let limiter = limiter(10.0, 20, 16);
        for i in 0..20 {
            assert!(limiter.check("10.0.0.1"), "request {i} should pass");
        }
        assert!(!limiter.check("10.0.0.1"));

        // 1/ρ = 100ms buys exactly one token.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_burst() {
        let bucket = TokenBucket::new(3, 10.0);
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 3.0);
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn clients_have_independent_budgets() {
        let limiter = limiter(1.0, 1, 16);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_client_is_evicted() {
        let limiter = limiter(1.0, 1, 2);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(limiter.check("c"));
        assert_eq!(limiter.tracked_clients(), 2);

        // "a" was evicted, so it comes back with a fresh bucket.
        assert!(limiter.check("a"));
        // "c" is still tracked and exhausted.
        assert!(!limiter.check("c"));
    }
}
