//! Per-identity request budgets.
//!
//! A rolling 60-second window per identity (token hash, or client address
//! when auth is disabled). The steady rate is `requestsPerMinute`; short
//! bursts up to `ceil(1.5 × rate)` are tolerated within one window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The rolling window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of an admission check, carrying everything the response headers
/// need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// The advertised steady limit (`X-RateLimit-Limit`).
    pub limit: u32,
    /// Requests left in the current window (`X-RateLimit-Remaining`).
    pub remaining: u32,
    /// Seconds until the window frees a slot (`X-RateLimit-Reset`).
    pub reset_seconds: u64,
}

/// Injected rate-limit state, owned by the server.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: u32,
    burst: u32,
}

impl RateLimiter {
    /// Build a limiter with the given steady rate and burst allowance.
    pub fn new(limit: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            burst: burst.max(limit),
        }
    }

    /// Admit or refuse one request for `identity`.
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate lock poisoned");
        let bucket = buckets.entry(identity.to_string()).or_default();

        while let Some(&front) = bucket.front() {
            if now.duration_since(front) > WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }

        let used = bucket.len() as u32;
        let reset_seconds = bucket
            .front()
            .map(|&front| WINDOW.saturating_sub(now.duration_since(front)).as_secs().max(1))
            .unwrap_or(0);

        if used >= self.burst {
            return RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_seconds,
            };
        }

        bucket.push_back(now);
        RateDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.burst - used - 1,
            reset_seconds,
        }
    }

    /// Number of identities currently tracked (for the security summary).
    pub fn tracked_identities(&self) -> usize {
        self.buckets.lock().expect("rate lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_burst_then_refuses() {
        let limiter = RateLimiter::new(4, 6);
        for i in 0..6 {
            let d = limiter.check("c");
            assert!(d.allowed, "request {i} should be admitted");
            assert_eq!(d.limit, 4);
        }
        let d = limiter.check("c");
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset_seconds >= 1);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new(2, 3);
        assert_eq!(limiter.check("c").remaining, 2);
        assert_eq!(limiter.check("c").remaining, 1);
        assert_eq!(limiter.check("c").remaining, 0);
        assert!(!limiter.check("c").allowed);
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn burst_never_undercuts_the_steady_rate() {
        let limiter = RateLimiter::new(10, 1);
        for _ in 0..10 {
            assert!(limiter.check("c").allowed);
        }
    }
}
