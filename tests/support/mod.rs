//! Fakes shared by the behavior tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokenfetch_core::{
    Backoff, BatchOrchestrator, ErrorKind, FetchError, FetchWindow, QuoteBatch, QuotePoint,
    QuoteRequest, QuoteSource, RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What the fake provider does for one id on one call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Quote(f64),
    Empty,
    /// Answered, but the id's quote is unusable. Only this id fails.
    BadQuote,
    /// Fails the whole request the id is part of.
    Fail(ErrorKind),
    /// Never answers, so the attempt times out.
    Hang,
}

/// Quote source driven by a per-id script.
///
/// Each call pops the next step for every requested id. Once a script runs out the fallback
/// applies, which defaults to quoting the id itself as the price.
pub struct ScriptedSource {
    scripts: Mutex<HashMap<i64, VecDeque<Step>>>,
    fallbacks: HashMap<i64, Step>,
    calls: Mutex<Vec<(i64, Instant)>>,
    requests: Mutex<Vec<Instant>>,
    max_ids: usize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallbacks: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            max_ids: 1,
            cancel_after: None,
        }
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps played for `id`, one per call, before the fallback takes over.
    pub fn script(self, id: i64, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(id, steps.into_iter().collect());
        self
    }

    /// Step repeated for `id` once its script is exhausted.
    pub fn always(mut self, id: i64, step: Step) -> Self {
        self.fallbacks.insert(id, step);
        self
    }

    pub fn with_max_ids(mut self, max_ids: usize) -> Self {
        self.max_ids = max_ids;
        self
    }

    /// Cancel `token` once `calls` requests have been made.
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    /// Calls made for `id`.
    pub fn calls_for(&self, id: i64) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(called, _)| *called == id)
            .count()
    }

    /// Number of requests made, counting a multi-id request once.
    pub fn requests(&self) -> usize {
        self.request_times().len()
    }

    /// Instants at which requests went out, in order.
    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn next_step(&self, id: i64) -> Step {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.fallbacks.get(&id).copied())
            .unwrap_or(Step::Quote(id as f64))
    }
}

impl QuoteSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn max_ids_per_request(&self) -> usize {
        self.max_ids
    }

    fn fetch_quotes<'a>(
        &'a self,
        request: QuoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<QuoteBatch, FetchError>> + Send + 'a>> {
        let now = Instant::now();
        let steps: Vec<(i64, Step)> = request.ids().map(|id| (id, self.next_step(id))).collect();

        self.calls
            .lock()
            .expect("calls lock")
            .extend(steps.iter().map(|(id, _)| (*id, now)));
        let made = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.push(now);
            requests.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if made >= *after {
                token.cancel();
            }
        }

        Box::pin(async move {
            let mut batch = QuoteBatch::new();
            for (id, step) in steps {
                match step {
                    Step::Quote(price) => {
                        batch.insert(
                            id,
                            Ok(QuotePoint {
                                price,
                                market_cap: Some(price * 1_000.0),
                            }),
                        );
                    }
                    Step::Empty => {}
                    Step::BadQuote => {
                        batch.insert(
                            id,
                            Err(FetchError::malformed_payload(format!(
                                "scripted bad quote for {id}"
                            ))),
                        );
                    }
                    Step::Fail(kind) => {
                        return Err(FetchError::new(kind, format!("scripted {kind} for {id}")));
                    }
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
            Ok(batch)
        })
    }
}

pub fn jan_window() -> FetchWindow {
    FetchWindow::parse("2024-01-01", "2024-01-02").expect("valid window")
}

pub fn limiter(max_requests: u32, window_secs: u64, cooldown_secs: u64) -> Arc<RateLimiter> {
    Arc::new(
        RateLimiter::new(RateLimiterConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
            cooldown: Duration::from_secs(cooldown_secs),
            pacing: false,
        })
        .expect("valid limiter"),
    )
}

/// Retry policy with a short fixed backoff so paused-clock tests stay readable.
pub fn fixed_retry(max_attempts: u32, attempt_timeout: Duration) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_attempts,
        max_rate_limited_attempts: 10,
        backoff: Backoff::Fixed {
            delay: Duration::from_millis(100),
        },
        attempt_timeout,
    })
}

/// Engine over `source` with a generous budget, 3 hard attempts and a 5 s attempt timeout.
pub fn engine(source: Arc<ScriptedSource>) -> BatchOrchestrator {
    BatchOrchestrator::new(source, limiter(100, 60, 66))
        .with_retry(fixed_retry(3, Duration::from_secs(5)))
}
