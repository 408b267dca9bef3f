//! Bounded retry loop with exponential backoff and jitter.
//!
//! Hard failures (timeouts, transport and server errors) and rate-limit answers are counted
//! against separate ceilings. A rate-limited attempt puts the shared limiter into cooldown
//! instead of sleeping here, so the wait is paid once by every caller rather than per task.
//!
//! Cancellation is honoured between attempts: the limiter wait and the backoff sleep end early,
//! and no new attempt starts once the token fires. An attempt already on the wire may finish.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data_source::{ErrorKind, FetchError};
use crate::domain::FetchStatus;
use crate::provider_policy::ProviderPolicy;
use crate::throttling::RateLimiter;

/// Backoff strategy between hard failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^retry`, capped at `max`, optionally spread by +/- 50%.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if jitter {
                    let spread = delay.as_millis() as u64 / 2;
                    let offset = fastrand::u64(0..=spread * 2);
                    let millis = (delay.as_millis() as u64 + offset).saturating_sub(spread);
                    Duration::from_millis(millis)
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts allowed for hard failures. An always-failing call runs exactly this often.
    pub max_attempts: u32,
    /// Total attempts allowed for rate-limited answers.
    pub max_rate_limited_attempts: u32,
    pub backoff: Backoff,
    /// Hard ceiling for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_policy(&ProviderPolicy::coinmarketcap_default())
    }
}

impl RetryConfig {
    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        let backoff = &policy.retry_backoff;
        Self {
            max_attempts: backoff.max_attempts,
            max_rate_limited_attempts: backoff.max_rate_limited_attempts,
            backoff: Backoff::Exponential {
                base: backoff.initial_delay,
                factor: backoff.multiplier,
                max: backoff.max_delay,
                jitter: true,
            },
            attempt_timeout: policy.request_timeout,
        }
    }

    /// Delay after the `hard_failures`-th hard failure (1-based).
    pub fn delay_after(&self, hard_failures: u32) -> Duration {
        self.backoff.delay(hard_failures.saturating_sub(1))
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub kind: ErrorKind,
    /// `Invalid` for non-retryable kinds, `Error` once retries are exhausted.
    pub status: FetchStatus,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    Failed(RetryFailure),
    /// Stopped before the next attempt because the run was cancelled.
    Cancelled { attempts: u32 },
}

#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    hard_failures: u32,
    rate_limited: u32,
    last_error: Option<ErrorKind>,
}

impl RetryState {
    fn fail(&self, status: FetchStatus, error: FetchError) -> RetryFailure {
        RetryFailure {
            kind: self.last_error.unwrap_or(error.kind()),
            status,
            attempts: self.attempt,
            message: error.message().to_owned(),
        }
    }
}

/// Drives one operation through the limiter until it succeeds or hits a ceiling.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until success or a terminal outcome.
    ///
    /// Every attempt first passes through `limiter.acquire()` and then runs under
    /// `attempt_timeout`. Attempt `k + 1` never starts before attempt `k` has finished, and
    /// never starts at all once `cancel` has fired.
    pub async fn execute<T, F, Fut>(
        &self,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
        label: &str,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut state = RetryState::default();

        loop {
            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = limiter.acquire() => true,
            };
            if !admitted {
                info!(unit = label, attempts = state.attempt, "cancelled before next attempt");
                return RetryOutcome::Cancelled {
                    attempts: state.attempt,
                };
            }
            state.attempt += 1;

            let started = Instant::now();
            let result = match tokio::time::timeout(self.config.attempt_timeout, operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::timeout(format!(
                    "attempt exceeded {}ms",
                    self.config.attempt_timeout.as_millis()
                ))),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let failure = match result {
                Ok(value) => {
                    debug!(unit = label, attempt = state.attempt, elapsed_ms, "fetch succeeded");
                    return RetryOutcome::Success {
                        value,
                        attempts: state.attempt,
                    };
                }
                Err(failure) => failure,
            };

            let kind = failure.kind();
            state.last_error = Some(kind);

            if !failure.retryable() {
                error!(
                    unit = label,
                    attempt = state.attempt,
                    kind = kind.as_str(),
                    elapsed_ms,
                    message = failure.message(),
                    "fetch failed with a terminal error"
                );
                return RetryOutcome::Failed(state.fail(FetchStatus::Invalid, failure));
            }

            if kind == ErrorKind::RateLimited {
                limiter.notify_quota_exhausted();
                state.rate_limited += 1;
                if state.rate_limited >= self.config.max_rate_limited_attempts {
                    error!(
                        unit = label,
                        attempts = state.attempt,
                        "rate limit retries exhausted"
                    );
                    return RetryOutcome::Failed(state.fail(FetchStatus::Error, failure));
                }
                warn!(
                    unit = label,
                    attempt = state.attempt,
                    elapsed_ms,
                    "rate limited, retrying after cooldown"
                );
                continue;
            }

            state.hard_failures += 1;
            if state.hard_failures >= self.config.max_attempts {
                error!(
                    unit = label,
                    attempts = state.attempt,
                    kind = kind.as_str(),
                    message = failure.message(),
                    "retries exhausted"
                );
                return RetryOutcome::Failed(state.fail(FetchStatus::Error, failure));
            }

            let delay = self.config.delay_after(state.hard_failures);
            warn!(
                unit = label,
                attempt = state.attempt,
                kind = kind.as_str(),
                elapsed_ms,
                delay_ms = delay.as_millis() as u64,
                "transient fetch failure, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(unit = label, attempts = state.attempt, "cancelled during backoff");
                    return RetryOutcome::Cancelled {
                        attempts: state.attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
