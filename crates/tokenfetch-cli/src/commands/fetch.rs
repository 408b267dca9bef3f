//! `tokenfetch fetch`: resolve inputs, wire the engine from the provider policy and run it.

use std::sync::Arc;
use std::time::Duration;

use tokenfetch_core::{
    cmc_api_key_from_env, open_cache_or_memory, BatchOrchestrator, BatchProgress, BatchReport,
    CoinMarketCapSource, FetchWindow, HttpAuth, HttpClient, MemoryCache, NoopHttpClient,
    ProviderPolicy, QuoteCache, QuoteSource, ReqwestHttpClient, WarehouseConfig, WindowPolicy,
};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{FetchArgs, TuningArgs};
use crate::error::CliError;
use crate::input::collect_entities;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(args: &FetchArgs) -> Result<BatchReport, CliError> {
    let entities = collect_entities(&args.entities, args.input.as_deref())?;
    let window = FetchWindow::resolve(&args.start, &args.end, &WindowPolicy::default())?;
    let policy = build_policy(&args.tuning);
    policy.validate()?;

    let source = build_source(&args.tuning, &policy)?;
    let cache = build_cache(&args.tuning, &policy);
    let engine = BatchOrchestrator::from_policy(source, cache, &policy)?;

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_watcher(cancel.clone());
    let progress = spawn_progress_logger(engine.progress());

    let outcome = run_passes(&engine, entities, window, args.retry_failed, &cancel).await;

    interrupt.abort();
    progress.abort();
    outcome
}

async fn run_passes(
    engine: &BatchOrchestrator,
    entities: Vec<(i64, String)>,
    window: FetchWindow,
    retry_failed: u32,
    cancel: &CancellationToken,
) -> Result<BatchReport, CliError> {
    let mut report = engine.run(entities, window, cancel.clone()).await?;

    for pass in 1..=retry_failed {
        if report.is_complete() || cancel.is_cancelled() {
            break;
        }
        let candidates = report.retry_candidates();
        info!(pass, entities = candidates.len(), "retrying failed entities");
        let retry = engine.run(candidates, window, cancel.clone()).await?;
        report = report.absorb_retry(retry);
    }

    Ok(report)
}

/// Provider defaults with any command-line overrides applied.
fn build_policy(tuning: &TuningArgs) -> ProviderPolicy {
    let mut policy = ProviderPolicy::coinmarketcap_default();

    if let Some(concurrency) = tuning.concurrency {
        policy.max_concurrency = concurrency;
    }
    if let Some(batch_size) = tuning.batch_size {
        policy.max_ids_per_request = batch_size;
    }
    if let Some(max_requests) = tuning.max_requests {
        policy.quota_limit = max_requests;
    }
    if let Some(window_secs) = tuning.window_secs {
        policy.quota_window = Duration::from_secs(window_secs);
    }
    if let Some(cooldown_secs) = tuning.cooldown_secs {
        policy.quota_cooldown = Duration::from_secs(cooldown_secs);
    }
    if let Some(max_attempts) = tuning.max_attempts {
        policy.retry_backoff.max_attempts = max_attempts;
    }
    if let Some(ttl_secs) = tuning.ttl_secs {
        policy.cache_ttl = Duration::from_secs(ttl_secs);
    }
    if let Some(timeout_ms) = tuning.timeout_ms {
        policy.request_timeout = Duration::from_millis(timeout_ms);
    }
    if tuning.pace {
        policy.pacing = true;
    }

    policy
}

fn build_source(
    tuning: &TuningArgs,
    policy: &ProviderPolicy,
) -> Result<Arc<dyn QuoteSource>, CliError> {
    let (http_client, auth): (Arc<dyn HttpClient>, HttpAuth) = if tuning.offline {
        warn!("offline mode, no network requests will be made");
        (Arc::new(NoopHttpClient), HttpAuth::None)
    } else {
        let key = cmc_api_key_from_env().ok_or_else(|| {
            CliError::Command(String::from(
                "no CoinMarketCap API key; set TOKENFETCH_CMC_API_KEY or pass --offline",
            ))
        })?;
        (Arc::new(ReqwestHttpClient::new()), HttpAuth::cmc_api_key(key))
    };

    Ok(Arc::new(CoinMarketCapSource::from_policy(
        http_client,
        auth,
        policy,
    )))
}

fn build_cache(tuning: &TuningArgs, policy: &ProviderPolicy) -> Arc<dyn QuoteCache> {
    if tuning.no_cache {
        return Arc::new(MemoryCache::disabled());
    }
    open_cache_or_memory(WarehouseConfig::default(), policy.cache_ttl)
}

fn spawn_interrupt_watcher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight requests");
            cancel.cancel();
        }
    })
}

fn spawn_progress_logger(progress: BatchProgress) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = progress.snapshot();
            info!(
                processed = snapshot.processed,
                total = snapshot.total,
                succeeded = snapshot.succeeded,
                failed = snapshot.failed,
                cache_hits = snapshot.cache_hits,
                "batch progress"
            );
        }
    })
}
