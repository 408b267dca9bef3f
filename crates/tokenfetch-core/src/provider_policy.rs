use std::env;
use std::time::Duration;

use crate::ConfigError;

/// Per-provider defaults for pacing, retries and batching.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPolicy {
    pub provider: &'static str,
    pub max_concurrency: usize,
    pub quota_window: Duration,
    pub quota_limit: u32,
    /// How long every caller waits after the provider reports quota exhaustion.
    pub quota_cooldown: Duration,
    /// Enforce an even `quota_window / quota_limit` gap between calls.
    pub pacing: bool,
    pub request_timeout: Duration,
    pub max_ids_per_request: usize,
    pub cache_ttl: Duration,
    pub retry_backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total attempts allowed for hard failures.
    pub max_attempts: u32,
    /// Total attempts allowed for `429` answers, counted separately.
    pub max_rate_limited_attempts: u32,
}

impl ProviderPolicy {
    pub fn coinmarketcap_default() -> Self {
        Self {
            provider: "coinmarketcap",
            max_concurrency: 4,
            quota_window: Duration::from_secs(60),
            quota_limit: 30,
            quota_cooldown: Duration::from_secs(66),
            pacing: false,
            request_timeout: Duration::from_secs(30),
            max_ids_per_request: 100,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            retry_backoff: BackoffPolicy {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                max_attempts: 3,
                max_rate_limited_attempts: 10,
            },
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_ids_per_request == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.quota_limit == 0 || self.quota_window.is_zero() {
            return Err(ConfigError::InvalidRateBudget);
        }
        if self.retry_backoff.max_attempts == 0 || self.retry_backoff.max_rate_limited_attempts == 0
        {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// CoinMarketCap API key from `TOKENFETCH_CMC_API_KEY`, falling back to `CMC_PRO_API_KEY`.
pub fn cmc_api_key_from_env() -> Option<String> {
    ["TOKENFETCH_CMC_API_KEY", "CMC_PRO_API_KEY"]
        .into_iter()
        .filter_map(|name| env::var(name).ok())
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty())
}
