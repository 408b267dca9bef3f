use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Transport health as seen by the batch workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive transport failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before one trial unit is let through.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the half-open trial unit is out.
    trial_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Stops dispatching network calls once the transport looks dead.
///
/// Only units whose retries ended in a transport failure count; any answer from the provider,
/// even an error status, closes the circuit again.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    /// Whether a unit may go out now.
    ///
    /// Half-open admits exactly one caller until its outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let timed_out = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.config.open_timeout);

                if timed_out {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.trial_in_flight = true;
                    info!("circuit half-open, sending one trial unit");
                }
                timed_out
            }
        }
    }

    /// Give the half-open slot back without judging the transport, e.g. after a cancelled unit.
    pub fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit closed");
        }
        *inner = CircuitInner::default();
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                "transport failing repeatedly, circuit open"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
