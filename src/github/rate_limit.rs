//! Local token-bucket rate limiting for the GitHub API.
//!
//! Two buckets mirror GitHub's own accounting: `search` (30/minute) and
//! `core` (5000/hour). Refill is continuous over elapsed wall clock, clamped
//! to capacity. The clock is injected so refill math is testable.

use std::sync::Mutex;

/// Injectable monotonic-enough clock (epoch milliseconds).
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Search,
    Core,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Core => "core",
        }
    }
}

/// One token bucket. Not thread-safe by itself; `RateLimiter` wraps a pair
/// in a mutex.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_ms: f64, now_ms: i64) -> Self {
        Self {
            capacity,
            refill_per_ms,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// GitHub search quota: 30 requests/minute.
    pub fn search(now_ms: i64) -> Self {
        Self::new(30.0, 30.0 / 60_000.0, now_ms)
    }

    /// GitHub core quota: 5000 requests/hour.
    pub fn core(now_ms: i64) -> Self {
        Self::new(5_000.0, 5_000.0 / 3_600_000.0, now_ms)
    }

    fn refill(&mut self, now_ms: i64) {
        let elapsed = (now_ms - self.last_refill_ms).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Try to take one token. Returns 0 on success, otherwise the wait in
    /// milliseconds until a token will be available:
    /// `ceil((1 - tokens) / refill_per_ms)`.
    pub fn consume(&mut self, now_ms: i64) -> u64 {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            0
        } else {
            ((1.0 - self.tokens) / self.refill_per_ms).ceil() as u64
        }
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        self.tokens
    }
}

/// The two-bucket limiter owned by a `GithubClient` instance. Per-run state;
/// cross-process fairness comes from respecting upstream limits.
pub struct RateLimiter {
    buckets: Mutex<(TokenBucket, TokenBucket)>,
}

impl RateLimiter {
    pub fn new(now_ms: i64) -> Self {
        Self {
            buckets: Mutex::new((TokenBucket::search(now_ms), TokenBucket::core(now_ms))),
        }
    }

    /// Returns 0 when a token was taken, else milliseconds to wait.
    pub fn consume(&self, bucket: Bucket, now_ms: i64) -> u64 {
        let mut guard = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match bucket {
            Bucket::Search => guard.0.consume(now_ms),
            Bucket::Core => guard.1.consume(now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_grants_up_to_capacity() {
        let mut bucket = TokenBucket::new(3.0, 1.0 / 1_000.0, 0);
        assert_eq!(bucket.consume(0), 0);
        assert_eq!(bucket.consume(0), 0);
        assert_eq!(bucket.consume(0), 0);
        assert!(bucket.consume(0) > 0);
    }

    #[test]
    fn empty_bucket_reports_wait_from_formula() {
        // 1 token per second.
        let rate = 1.0 / 1_000.0;
        let mut bucket = TokenBucket::new(1.0, rate, 0);
        assert_eq!(bucket.consume(0), 0);
        // Drained at t=0; tokens == 0, so wait == ceil((1 - 0) / rate) == 1000.
        assert_eq!(bucket.consume(0), 1_000);
        // 400ms later tokens == 0.4, wait == ceil(0.6 / rate) == 600.
        assert_eq!(bucket.consume(400), 600);
    }

    #[test]
    fn refills_linearly_and_clamps_to_capacity() {
        let mut bucket = TokenBucket::new(2.0, 1.0 / 1_000.0, 0);
        assert_eq!(bucket.consume(0), 0);
        assert_eq!(bucket.consume(0), 0);
        // Half a second -> half a token.
        bucket.refill(500);
        assert!((bucket.available() - 0.5).abs() < 1e-9);
        // A long pause refills to capacity, not beyond.
        bucket.refill(1_000_000);
        assert!((bucket.available() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn search_bucket_matches_github_quota() {
        let mut bucket = TokenBucket::search(0);
        for _ in 0..30 {
            assert_eq!(bucket.consume(0), 0);
        }
        // Empty; one token takes 2 seconds at 30/minute.
        assert_eq!(bucket.consume(0), 2_000);
    }

    #[test]
    fn limiter_tracks_buckets_independently() {
        let limiter = RateLimiter::new(0);
        for _ in 0..30 {
            assert_eq!(limiter.consume(Bucket::Search, 0), 0);
        }
        assert!(limiter.consume(Bucket::Search, 0) > 0);
        assert_eq!(limiter.consume(Bucket::Core, 0), 0);
    }
}
