//! Keyed admission control over governor's GCRA token bucket.
//!
//! Callers sharing a key share one bucket, so fairness falls out of
//! GCRA's single theoretical-arrival-time per key.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;

use catga_core::Result;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub is_acquired: bool,
    /// Hint for how long to back off before the next attempt.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    pub fn acquired() -> Self {
        Self { is_acquired: true, retry_after: None }
    }

    pub fn rejected(retry_after: Duration) -> Self {
        Self { is_acquired: false, retry_after: Some(retry_after) }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(&self, key: &str) -> Result<RateLimitDecision>;
}

/// One token-bucket per key, all built from the same quota.
pub struct GovernorRateLimiter {
    limiters: DashMap<String, Arc<DirectLimiter>>,
    quota: Quota,
    clock: DefaultClock,
}

impl GovernorRateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self { limiters: DashMap::new(), quota, clock: DefaultClock::default() }
    }

    /// Quota of `permits` per minute.
    pub fn per_minute(permits: u32) -> Self {
        let permits = NonZeroU32::new(permits.max(1)).expect("max(1) is non-zero");
        Self::new(Quota::per_minute(permits))
    }

    /// Quota of `permits` per second.
    pub fn per_second(permits: u32) -> Self {
        let permits = NonZeroU32::new(permits.max(1)).expect("max(1) is non-zero");
        Self::new(Quota::per_second(permits))
    }

    fn limiter_for(&self, key: &str) -> Arc<DirectLimiter> {
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(governor::RateLimiter::direct(self.quota)))
            .clone()
    }
}

#[async_trait]
impl RateLimiter for GovernorRateLimiter {
    async fn try_acquire(&self, key: &str) -> Result<RateLimitDecision> {
        let limiter = self.limiter_for(key);
        match limiter.check() {
            Ok(()) => Ok(RateLimitDecision::acquired()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Ok(RateLimitDecision::rejected(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_within_quota_is_admitted() {
        let limiter = GovernorRateLimiter::per_minute(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire("tenant-a").await.unwrap().is_acquired);
        }
        let decision = limiter.try_acquire("tenant-a").await.unwrap();
        assert!(!decision.is_acquired);
        assert!(decision.retry_after.is_some());
    }

    #[tokio::test]
    async fn keys_have_independent_buckets() {
        let limiter = GovernorRateLimiter::per_minute(1);
        assert!(limiter.try_acquire("a").await.unwrap().is_acquired);
        assert!(!limiter.try_acquire("a").await.unwrap().is_acquired);
        // A different key still has its budget.
        assert!(limiter.try_acquire("b").await.unwrap().is_acquired);
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let limiter = GovernorRateLimiter::per_second(50);
        while limiter.try_acquire("k").await.unwrap().is_acquired {}

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire("k").await.unwrap().is_acquired);
    }
}
