//! Sliding-window request budget with a provider-signalled cooldown.
//!
//! The limiter only delays callers, it never fails them. Quota exhaustion is not detected here:
//! whoever sees the provider's `429` calls [`RateLimiter::notify_quota_exhausted`].

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::provider_policy::ProviderPolicy;
use crate::ConfigError;

type Pacer = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub pacing: bool,
}

impl RateLimiterConfig {
    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self {
            max_requests: policy.quota_limit,
            window: policy.quota_window,
            cooldown: policy.quota_cooldown,
            pacing: policy.pacing,
        }
    }
}

#[derive(Debug, Default)]
struct RateBudget {
    timestamps: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl RateBudget {
    /// Time to wait before a request is allowed at `now`, or `None` when one may go out.
    fn wait_at(&mut self, now: Instant, config: &RateLimiterConfig) -> Option<Duration> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Some(until - now);
            }
            self.cooldown_until = None;
            self.timestamps.clear();
        }

        self.evict(now, config.window);

        let max_requests = usize::try_from(config.max_requests).unwrap_or(usize::MAX);
        if self.timestamps.len() < max_requests {
            return None;
        }

        self.timestamps
            .front()
            .map(|oldest| (*oldest + config.window).saturating_duration_since(now))
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared outbound-request gate for one provider.
pub struct RateLimiter {
    config: RateLimiterConfig,
    budget: Mutex<RateBudget>,
    pacer: Option<Pacer>,
    cooldowns_triggered: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        if config.max_requests == 0 || config.window.is_zero() {
            return Err(ConfigError::InvalidRateBudget);
        }

        let pacer = if config.pacing {
            let spacing = config.window / config.max_requests;
            Quota::with_period(spacing)
                .map(|quota| quota.allow_burst(NonZeroU32::MIN))
                .map(Pacer::direct)
        } else {
            None
        };

        Ok(Self {
            config,
            budget: Mutex::new(RateBudget::default()),
            pacer,
            cooldowns_triggered: AtomicU64::new(0),
        })
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Result<Self, ConfigError> {
        Self::new(RateLimiterConfig::from_policy(policy))
    }

    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait until one more request fits in the budget, then record it.
    pub async fn acquire(&self) {
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        loop {
            let wait = {
                let mut budget = self.lock_budget();
                let now = Instant::now();
                match budget.wait_at(now, &self.config) {
                    None => {
                        budget.timestamps.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limiter delaying request");
            tokio::time::sleep(wait).await;
        }
    }

    /// Block every later `acquire` for the configured cooldown.
    ///
    /// Overlapping notifications extend the cooldown to the latest deadline and never shorten it.
    pub fn notify_quota_exhausted(&self) {
        let deadline = Instant::now() + self.config.cooldown;
        {
            let mut budget = self.lock_budget();
            budget.cooldown_until = Some(match budget.cooldown_until {
                Some(existing) if existing > deadline => existing,
                _ => deadline,
            });
        }

        let total = self.cooldowns_triggered.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            cooldown_secs = self.config.cooldown.as_secs_f64(),
            cooldowns = total,
            "provider quota exhausted, pausing all requests"
        );
    }

    pub fn cooldowns_triggered(&self) -> u64 {
        self.cooldowns_triggered.load(Ordering::Relaxed)
    }

    /// Requests recorded inside the current window.
    pub fn recorded_in_window(&self) -> usize {
        let mut budget = self.lock_budget();
        budget.evict(Instant::now(), self.config.window);
        budget.timestamps.len()
    }

    pub fn in_cooldown(&self) -> bool {
        let budget = self.lock_budget();
        budget
            .cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn lock_budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter budget mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64, cooldown_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
            cooldown: Duration::from_secs(cooldown_secs),
            pacing: false,
        })
        .expect("valid limiter")
    }

    #[test]
    fn rejects_empty_budget() {
        let result = RateLimiter::new(RateLimiterConfig {
            max_requests: 0,
            window: Duration::from_secs(1),
            cooldown: Duration::from_secs(1),
            pacing: false,
        });
        assert!(matches!(result, Err(ConfigError::InvalidRateBudget)));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_within_budget_pass_immediately() {
        let limiter = limiter(3, 10, 66);
        let started = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(limiter.recorded_in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn request_over_budget_waits_for_oldest_to_leave_window() {
        let limiter = limiter(2, 10, 66);
        let started = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_then_resets_budget() {
        let limiter = limiter(2, 10, 66);
        limiter.acquire().await;
        limiter.acquire().await;

        limiter.notify_quota_exhausted();
        assert!(limiter.in_cooldown());

        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(started.elapsed() >= Duration::from_secs(66));
        assert!(started.elapsed() < Duration::from_secs(67));
        assert_eq!(limiter.cooldowns_triggered(), 1);
        assert_eq!(limiter.recorded_in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_notifications_never_shorten_the_cooldown() {
        let limiter = limiter(5, 10, 66);
        limiter.notify_quota_exhausted();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.notify_quota_exhausted();

        let started = Instant::now();
        limiter.acquire().await;

        assert!(started.elapsed() >= Duration::from_secs(66));
        assert_eq!(limiter.cooldowns_triggered(), 2);
    }

    #[tokio::test]
    async fn pacing_spreads_requests_evenly() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 20,
            window: Duration::from_secs(1),
            cooldown: Duration::from_secs(1),
            pacing: true,
        })
        .expect("valid limiter");
        let started = std::time::Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
