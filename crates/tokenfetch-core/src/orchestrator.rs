//! Batch orchestration: deduplicate, serve from cache, fan the misses out to a bounded worker
//! pool and fold every outcome into a single [`BatchReport`].
//!
//! Every deduplicated entity ends up in exactly one of `results`, `errors` or `cancelled`.
//!
//! ```text
//!  entities ──▶ dedupe ──▶ cache lookup ──hit──────────────────────────────┐
//!                              │ miss                                       │
//!                              ▼                                            ▼
//!                      work units (≤ N ids) ──▶ workers ──▶ breaker ──▶ retry ──▶ source
//!                                                  │                        │
//!                                                  └── cache write-back ◀───┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, MemoryCache, QuoteCache};
use crate::circuit_breaker::CircuitBreaker;
use crate::data_source::{ErrorKind, QuoteRequest, QuoteSource};
use crate::domain::{EntityRef, FetchResult, FetchStatus, FetchWindow, UtcDateTime};
use crate::provider_policy::ProviderPolicy;
use crate::retry::{RetryConfig, RetryOutcome, RetryPolicy};
use crate::throttling::RateLimiter;
use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Worker tasks pulling units concurrently.
    pub concurrency_limit: usize,
    /// Upper bound on ids per unit. The source's own limit still applies.
    pub max_ids_per_unit: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_ids_per_unit: None,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_ids_per_unit == Some(0) {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Ledger entry for an entity that ended as `invalid` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub entity: EntityRef,
    pub status: FetchStatus,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

impl ErrorEntry {
    /// The value-less result this entry stands for.
    pub fn result(&self) -> FetchResult {
        FetchResult::failed(self.entity.clone(), self.status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub ok: usize,
    pub no_data: usize,
    pub invalid: usize,
    pub error: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub cooldowns: u64,
    pub elapsed_ms: u64,
}

/// Complete outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub window: FetchWindow,
    pub started_at: UtcDateTime,
    pub finished_at: UtcDateTime,
    /// `ok` and `no_data` results, in input order.
    pub results: Vec<FetchResult>,
    pub errors: Vec<ErrorEntry>,
    /// Entities left unfinished because the run was cancelled.
    pub cancelled: Vec<EntityRef>,
    pub summary: BatchSummary,
    /// Deduplicated input ids, first occurrence first.
    #[serde(skip)]
    order: Vec<i64>,
}

impl BatchReport {
    /// No errors and nothing left undispatched.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.cancelled.is_empty()
    }

    /// Entities worth another pass: failures first, then cancelled ones.
    pub fn retry_candidates(&self) -> Vec<(i64, String)> {
        self.errors
            .iter()
            .map(|entry| &entry.entity)
            .chain(self.cancelled.iter())
            .map(|entity| (entity.id(), entity.symbol().to_owned()))
            .collect()
    }

    /// Fold a pass over [`retry_candidates`](Self::retry_candidates) into this report.
    ///
    /// The retry pass's ledger replaces this one and its results join this one's, all in input
    /// order. Counters that accumulate over time are summed.
    pub fn absorb_retry(mut self, retry: BatchReport) -> Self {
        self.results.extend(retry.results);
        self.errors = retry.errors;
        self.cancelled = retry.cancelled;
        self.finished_at = retry.finished_at;
        InputOrder::new(&self.order).sort(&mut self.results, &mut self.errors, &mut self.cancelled);
        self.summary = BatchSummary {
            total: self.summary.total,
            ok: count_status(&self.results, FetchStatus::Ok),
            no_data: count_status(&self.results, FetchStatus::NoData),
            invalid: count_ledger(&self.errors, FetchStatus::Invalid),
            error: count_ledger(&self.errors, FetchStatus::Error),
            cancelled: self.cancelled.len(),
            cache_hits: self.summary.cache_hits + retry.summary.cache_hits,
            cooldowns: self.summary.cooldowns + retry.summary.cooldowns,
            elapsed_ms: self.summary.elapsed_ms + retry.summary.elapsed_ms,
        };
        self
    }
}

#[derive(Debug, Default)]
struct ProgressCounters {
    total: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
}

/// Live counters shared with whoever wants to watch a run. Values only ever grow.
#[derive(Debug, Clone, Default)]
pub struct BatchProgress {
    inner: Arc<ProgressCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
}

impl BatchProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.inner.total.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
        }
    }

    fn add_total(&self, count: usize) {
        self.inner.total.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.record_success();
    }

    fn record_success(&self) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Position of each id in the deduplicated input.
struct InputOrder(HashMap<i64, usize>);

impl InputOrder {
    fn new(ids: &[i64]) -> Self {
        Self(
            ids.iter()
                .enumerate()
                .map(|(position, id)| (*id, position))
                .collect(),
        )
    }

    fn position(&self, id: i64) -> usize {
        self.0.get(&id).copied().unwrap_or(usize::MAX)
    }

    fn sort(
        &self,
        results: &mut [FetchResult],
        errors: &mut [ErrorEntry],
        cancelled: &mut [EntityRef],
    ) {
        results.sort_by_key(|result| self.position(result.entity().id()));
        errors.sort_by_key(|entry| self.position(entry.entity.id()));
        cancelled.sort_by_key(|entity| self.position(entity.id()));
    }
}

#[derive(Debug)]
struct WorkUnit {
    index: usize,
    entities: Vec<EntityRef>,
}

#[derive(Debug)]
enum EntityOutcome {
    Fetched(FetchResult),
    Failed(ErrorEntry),
    Cancelled(EntityRef),
}

/// Everything a worker task needs, shared by all workers of one run.
struct WorkerContext {
    source: Arc<dyn QuoteSource>,
    cache: Arc<dyn QuoteCache>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    progress: BatchProgress,
    window: FetchWindow,
    queue: Mutex<VecDeque<WorkUnit>>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn next_unit(&self) -> Option<WorkUnit> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.lock_queue().pop_front()
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<WorkUnit>> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            warn!("work queue mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    async fn drain(self: Arc<Self>) -> Vec<EntityOutcome> {
        let mut outcomes = Vec::new();
        while let Some(unit) = self.next_unit() {
            outcomes.extend(self.process(unit).await);
        }
        outcomes
    }

    /// Put the ids of `unit` back at the head of the queue, one unit each.
    fn requeue_singly(&self, unit: WorkUnit) {
        let mut queue = self.lock_queue();
        for entity in unit.entities.into_iter().rev() {
            queue.push_front(WorkUnit {
                index: unit.index,
                entities: vec![entity],
            });
        }
    }

    /// Store fetched results without holding up the async workers.
    async fn write_back(&self, outcomes: &[EntityOutcome]) {
        let entries = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                EntityOutcome::Fetched(result) => {
                    Some(CacheEntry::new(result.clone(), self.window))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return;
        }

        let cache = Arc::clone(&self.cache);
        let written = tokio::task::spawn_blocking(move || {
            for entry in entries {
                let entity_id = entry.entity_id();
                if let Err(cache_error) = cache.put(entry) {
                    warn!(entity_id, %cache_error, "cache write failed");
                }
            }
        })
        .await;
        if let Err(join_error) = written {
            warn!(%join_error, "cache write task aborted");
        }
    }

    async fn process(&self, unit: WorkUnit) -> Vec<EntityOutcome> {
        if !self.breaker.allow_request() {
            warn!(unit = unit.index, ids = unit.entities.len(), "circuit open, skipping unit");
            return unit
                .entities
                .into_iter()
                .map(|entity| {
                    self.progress.record_failure();
                    EntityOutcome::Failed(ErrorEntry {
                        entity,
                        status: FetchStatus::Error,
                        kind: ErrorKind::NetworkError,
                        attempts: 0,
                        message: String::from("transport unavailable, circuit open"),
                    })
                })
                .collect();
        }

        let label = format!("unit-{}", unit.index);
        let request = QuoteRequest::new(unit.entities.clone(), self.window);
        let source = self.source.as_ref();
        debug!(
            unit = %label,
            ids = unit.entities.len(),
            source = source.name(),
            "dispatching unit"
        );

        let outcome = self
            .retry
            .execute(&self.limiter, &self.cancel, &label, move || {
                source.fetch_quotes(request.clone())
            })
            .await;

        match outcome {
            RetryOutcome::Success {
                value: mut quotes,
                attempts,
            } => {
                self.breaker.record_success();
                let outcomes = unit
                    .entities
                    .into_iter()
                    .map(|entity| match quotes.remove(&entity.id()) {
                        Some(Ok(point)) => EntityOutcome::Fetched(FetchResult::ok(entity, point)),
                        None => EntityOutcome::Fetched(FetchResult::no_data(entity)),
                        Some(Err(rejected)) => {
                            warn!(
                                unit = %label,
                                entity_id = entity.id(),
                                kind = rejected.kind().as_str(),
                                message = rejected.message(),
                                "answer for one id is unusable"
                            );
                            EntityOutcome::Failed(ErrorEntry {
                                entity,
                                status: if rejected.retryable() {
                                    FetchStatus::Error
                                } else {
                                    FetchStatus::Invalid
                                },
                                kind: rejected.kind(),
                                attempts,
                                message: rejected.message().to_owned(),
                            })
                        }
                    })
                    .collect::<Vec<_>>();

                self.write_back(&outcomes).await;
                for outcome in &outcomes {
                    match outcome {
                        EntityOutcome::Fetched(_) => self.progress.record_success(),
                        _ => self.progress.record_failure(),
                    }
                }
                outcomes
            }
            RetryOutcome::Failed(failure)
                if failure.kind == ErrorKind::ClientError && unit.entities.len() > 1 =>
            {
                self.breaker.record_success();
                warn!(
                    unit = %label,
                    ids = unit.entities.len(),
                    message = %failure.message,
                    "provider rejected a multi-id unit, retrying its ids one at a time"
                );
                self.requeue_singly(unit);
                Vec::new()
            }
            RetryOutcome::Cancelled { attempts } => {
                self.breaker.release_trial();
                info!(
                    unit = %label,
                    attempts,
                    ids = unit.entities.len(),
                    "unit cancelled mid-retry"
                );
                unit.entities
                    .into_iter()
                    .map(EntityOutcome::Cancelled)
                    .collect()
            }
            RetryOutcome::Failed(failure) => {
                if failure.kind.is_transport() {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                unit.entities
                    .into_iter()
                    .map(|entity| {
                        self.progress.record_failure();
                        EntityOutcome::Failed(ErrorEntry {
                            entity,
                            status: failure.status,
                            kind: failure.kind,
                            attempts: failure.attempts,
                            message: failure.message.clone(),
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Drives one batch of entities through cache, limiter, retry and source.
pub struct BatchOrchestrator {
    source: Arc<dyn QuoteSource>,
    cache: Arc<dyn QuoteCache>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    config: BatchConfig,
    progress: BatchProgress,
}

impl BatchOrchestrator {
    pub fn new(source: Arc<dyn QuoteSource>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            source,
            cache: Arc::new(MemoryCache::new(Duration::from_secs(24 * 60 * 60))),
            limiter,
            retry: RetryPolicy::default(),
            breaker: Arc::new(CircuitBreaker::default()),
            config: BatchConfig::default(),
            progress: BatchProgress::default(),
        }
    }

    /// Wire limiter, retry and batching from one provider policy.
    pub fn from_policy(
        source: Arc<dyn QuoteSource>,
        cache: Arc<dyn QuoteCache>,
        policy: &ProviderPolicy,
    ) -> Result<Self, ConfigError> {
        policy.validate()?;
        let limiter = Arc::new(RateLimiter::from_policy(policy)?);
        Ok(Self::new(source, limiter)
            .with_cache(cache)
            .with_retry(RetryPolicy::new(RetryConfig::from_policy(policy)))
            .with_config(BatchConfig {
                concurrency_limit: policy.max_concurrency,
                max_ids_per_unit: Some(policy.max_ids_per_request),
            }))
    }

    pub fn with_cache(mut self, cache: Arc<dyn QuoteCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handle that can be polled while a run is in flight.
    pub fn progress(&self) -> BatchProgress {
        self.progress.clone()
    }

    fn unit_size(&self) -> usize {
        let source_limit = self.source.max_ids_per_request().max(1);
        self.config
            .max_ids_per_unit
            .map_or(source_limit, |limit| limit.min(source_limit))
            .max(1)
    }

    /// Fetch every entity over `window`.
    ///
    /// Only invalid input is an error. Per-entity failures land in the report's ledger.
    pub async fn run<I, S>(
        &self,
        entities: I,
        window: FetchWindow,
        cancel: CancellationToken,
    ) -> Result<BatchReport, ConfigError>
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        self.config.validate()?;
        let entities = dedupe(entities)?;

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let started_at = UtcDateTime::now();
        let cooldowns_before = self.limiter.cooldowns_triggered();
        self.progress.add_total(entities.len());
        info!(
            %run_id,
            entities = entities.len(),
            %window,
            source = self.source.name(),
            "batch started"
        );

        let mut results = Vec::with_capacity(entities.len());
        let mut errors = Vec::new();
        let mut cancelled = Vec::new();
        let mut misses = Vec::new();
        let mut cache_hits = 0;

        let hits = lookup_cached(Arc::clone(&self.cache), entities.clone(), window).await;
        for (entity, hit) in entities.iter().zip(hits) {
            match hit {
                Some(hit) => {
                    debug!(entity_id = entity.id(), "cache hit");
                    self.progress.record_cache_hit();
                    cache_hits += 1;
                    results.push(hit);
                }
                None => misses.push(entity.clone()),
            }
        }

        let units = misses
            .chunks(self.unit_size())
            .enumerate()
            .map(|(index, chunk)| WorkUnit {
                index,
                entities: chunk.to_vec(),
            })
            .collect::<VecDeque<_>>();
        let workers = self.config.concurrency_limit.min(units.len());

        let context = Arc::new(WorkerContext {
            source: Arc::clone(&self.source),
            cache: Arc::clone(&self.cache),
            limiter: Arc::clone(&self.limiter),
            retry: self.retry.clone(),
            breaker: Arc::clone(&self.breaker),
            progress: self.progress.clone(),
            window,
            queue: Mutex::new(units),
            cancel: cancel.clone(),
        });

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(Arc::clone(&context).drain());
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            EntityOutcome::Fetched(result) => results.push(result),
                            EntityOutcome::Failed(entry) => errors.push(entry),
                            EntityOutcome::Cancelled(entity) => cancelled.push(entity),
                        }
                    }
                }
                Err(join_error) => error!(%join_error, "batch worker aborted"),
            }
        }

        cancelled.extend(
            context
                .lock_queue()
                .drain(..)
                .flat_map(|unit| unit.entities),
        );

        // A worker that died mid-unit leaves its entities unaccounted for.
        let accounted = results
            .iter()
            .map(|result| result.entity().id())
            .chain(errors.iter().map(|entry| entry.entity.id()))
            .chain(cancelled.iter().map(EntityRef::id))
            .collect::<HashSet<_>>();
        cancelled.extend(
            entities
                .iter()
                .filter(|entity| !accounted.contains(&entity.id()))
                .cloned(),
        );

        let order = entities.iter().map(EntityRef::id).collect::<Vec<_>>();
        InputOrder::new(&order).sort(&mut results, &mut errors, &mut cancelled);

        let summary = BatchSummary {
            total: entities.len(),
            ok: count_status(&results, FetchStatus::Ok),
            no_data: count_status(&results, FetchStatus::NoData),
            invalid: count_ledger(&errors, FetchStatus::Invalid),
            error: count_ledger(&errors, FetchStatus::Error),
            cancelled: cancelled.len(),
            cache_hits,
            cooldowns: self
                .limiter
                .cooldowns_triggered()
                .saturating_sub(cooldowns_before),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            %run_id,
            total = summary.total,
            ok = summary.ok,
            no_data = summary.no_data,
            invalid = summary.invalid,
            error = summary.error,
            cancelled = summary.cancelled,
            cache_hits = summary.cache_hits,
            cooldowns = summary.cooldowns,
            elapsed_ms = summary.elapsed_ms,
            "batch finished"
        );

        Ok(BatchReport {
            run_id,
            window,
            started_at,
            finished_at: UtcDateTime::now(),
            results,
            errors,
            cancelled,
            summary,
            order,
        })
    }
}

/// Cache lookups for `entities`, run on the blocking pool. A failed lookup counts as a miss.
async fn lookup_cached(
    cache: Arc<dyn QuoteCache>,
    entities: Vec<EntityRef>,
    window: FetchWindow,
) -> Vec<Option<FetchResult>> {
    let count = entities.len();
    let lookups = tokio::task::spawn_blocking(move || {
        entities
            .iter()
            .map(|entity| match cache.get(entity.id(), &window) {
                Ok(hit) => hit,
                Err(cache_error) => {
                    warn!(entity_id = entity.id(), %cache_error, "cache read failed, fetching");
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await;

    lookups.unwrap_or_else(|join_error| {
        warn!(%join_error, "cache lookup task aborted, fetching everything");
        vec![None; count]
    })
}

fn count_status(results: &[FetchResult], status: FetchStatus) -> usize {
    results
        .iter()
        .filter(|result| result.status() == status)
        .count()
}

fn count_ledger(errors: &[ErrorEntry], status: FetchStatus) -> usize {
    errors.iter().filter(|entry| entry.status == status).count()
}

/// Validate and collapse duplicate ids, keeping the first occurrence.
fn dedupe<I, S>(entities: I) -> Result<Vec<EntityRef>, ConfigError>
where
    I: IntoIterator<Item = (i64, S)>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = 0_usize;

    for (id, symbol) in entities {
        let entity = EntityRef::new(id, symbol)?;
        if seen.insert(entity.id()) {
            unique.push(entity);
        } else {
            duplicates += 1;
        }
    }

    if unique.is_empty() {
        return Err(ConfigError::EmptyEntityList);
    }
    if duplicates > 0 {
        debug!(duplicates, "collapsed duplicate entity ids");
    }
    Ok(unique)
}
