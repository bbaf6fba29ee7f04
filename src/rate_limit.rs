/// Plan-based rate limiting
///
/// Keyed limiters (user id, else client IP) with per-plan allowances. A zero
/// allowance means unlimited: no limiter is ever constructed for that plan,
/// so zero-requests can never be conflated with denial. A janitor evicts
/// idle keys once a minute.
use crate::config::RateLimitConfig;
use crate::identity::models::Plan;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct PlanRateLimiter {
    enabled: bool,
    standard: Option<KeyedLimiter>,
    premium: Option<KeyedLimiter>,
}

impl PlanRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let window = Duration::from_secs(config.window_secs.max(1));
        Self {
            enabled: config.enabled,
            standard: build_limiter(config.standard_per_window, window),
            premium: build_limiter(config.premium_per_window, window),
        }
    }

    /// Check whether a request under this key and plan is allowed
    pub fn allow(&self, key: &str, plan: Plan) -> bool {
        if !self.enabled {
            return true;
        }
        let limiter = match plan {
            Plan::Standard => &self.standard,
            Plan::Premium => &self.premium,
        };
        match limiter {
            None => true, // zero allowance = unlimited
            Some(l) => l.check_key(&key.to_string()).is_ok(),
        }
    }

    /// Evict keys idle beyond the window; run periodically
    pub fn cleanup(&self) {
        if let Some(l) = &self.standard {
            l.retain_recent();
        }
        if let Some(l) = &self.premium {
            l.retain_recent();
        }
    }
}

fn build_limiter(per_window: u32, window: Duration) -> Option<KeyedLimiter> {
    let per_window = NonZeroU32::new(per_window)?;
    let quota = Quota::with_period(window / per_window.get())?.allow_burst(per_window);
    Some(GovernorLimiter::keyed(quota))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(standard: u32, premium: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window_secs: 60,
            standard_per_window: standard,
            premium_per_window: premium,
        }
    }

    #[test]
    fn test_zero_allowance_is_unlimited() {
        let limiter = PlanRateLimiter::new(&config(0, 0));
        for _ in 0..10_000 {
            assert!(limiter.allow("user-1", Plan::Standard));
            assert!(limiter.allow("user-1", Plan::Premium));
        }
    }

    #[test]
    fn test_limit_enforced_per_key() {
        let limiter = PlanRateLimiter::new(&config(5, 0));

        let mut accepted = 0;
        for _ in 0..20 {
            if limiter.allow("user-a", Plan::Standard) {
                accepted += 1;
            }
        }
        assert!(accepted <= 5, "accepted {} > limit 5", accepted);

        // A different key has its own budget
        assert!(limiter.allow("user-b", Plan::Standard));
    }

    #[test]
    fn test_plans_are_independent() {
        let limiter = PlanRateLimiter::new(&config(1, 0));
        assert!(limiter.allow("k", Plan::Standard));
        assert!(!limiter.allow("k", Plan::Standard));
        // Premium allowance is 0 here, meaning unlimited
        for _ in 0..100 {
            assert!(limiter.allow("k", Plan::Premium));
        }
    }

    #[test]
    fn test_disabled_allows_everything() {
        let mut cfg = config(1, 1);
        cfg.enabled = false;
        let limiter = PlanRateLimiter::new(&cfg);
        for _ in 0..100 {
            assert!(limiter.allow("k", Plan::Standard));
        }
    }
}
