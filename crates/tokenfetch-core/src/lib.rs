//! # Tokenfetch Core
//!
//! Rate-limited batch acquisition of per-entity quotes from a quota-constrained HTTP API.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider adapters (CoinMarketCap) |
//! | [`cache`] | Result cache trait with memory and `DuckDB` implementations |
//! | [`circuit_breaker`] | Stops network calls when the transport is down |
//! | [`data_source`] | Source trait and fetch error taxonomy |
//! | [`domain`] | Entities, windows and fetch results |
//! | [`error`] | Core error types |
//! | [`http_client`] | HTTP client abstraction |
//! | [`orchestrator`] | Batch orchestration and reports |
//! | [`provider_policy`] | Per-provider defaults |
//! | [`retry`] | Bounded retry with backoff |
//! | [`throttling`] | Sliding-window rate limiter with cooldown |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │  Orchestrator   │────▶│  Quote Cache     │
//! └────────┬────────┘     └──────────────────┘
//!          │ misses
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Retry Policy    │────▶│ Rate Limiter     │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Quote Source    │────▶│ HTTP Client      │
//! │ (Adapter Trait) │     │ (reqwest/noop)   │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokenfetch_core::{
//!     BatchOrchestrator, CoinMarketCapSource, FetchWindow, HttpAuth, MemoryCache,
//!     ProviderPolicy, ReqwestHttpClient, WindowPolicy,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let policy = ProviderPolicy::coinmarketcap_default();
//! let source = CoinMarketCapSource::from_policy(
//!     Arc::new(ReqwestHttpClient::new()),
//!     HttpAuth::cmc_api_key("..."),
//!     &policy,
//! );
//! let engine = BatchOrchestrator::from_policy(
//!     Arc::new(source),
//!     Arc::new(MemoryCache::new(policy.cache_ttl)),
//!     &policy,
//! )?;
//! let window = FetchWindow::resolve("2024-01-01", "2024-01-31", &WindowPolicy::default())?;
//! let report = engine
//!     .run(vec![(1, "BTC"), (1027, "ETH")], window, CancellationToken::new())
//!     .await?;
//! println!("{} ok, {} failed", report.summary.ok, report.errors.len());
//! ```

pub mod adapters;
pub mod cache;
pub mod circuit_breaker;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod orchestrator;
pub mod provider_policy;
pub mod retry;
pub mod throttling;

pub use adapters::CoinMarketCapSource;

pub use cache::{
    open_cache_or_memory, CacheEntry, CacheError, MemoryCache, PersistentCache, QuoteCache,
};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use data_source::{ErrorKind, FetchError, QuoteBatch, QuoteRequest, QuoteSource};

pub use domain::{
    EntityRef, FetchResult, FetchStatus, FetchWindow, QuotePoint, UtcDateTime, WindowPolicy,
};

pub use error::{ConfigError, CoreError};

pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpRequest, HttpResponse, NoopHttpClient,
    ReqwestHttpClient,
};

pub use orchestrator::{
    BatchConfig, BatchOrchestrator, BatchProgress, BatchReport, BatchSummary, ErrorEntry,
    ProgressSnapshot,
};

pub use provider_policy::{cmc_api_key_from_env, BackoffPolicy, ProviderPolicy};

pub use retry::{Backoff, RetryConfig, RetryFailure, RetryOutcome, RetryPolicy};

pub use throttling::{RateLimiter, RateLimiterConfig};

pub use tokenfetch_warehouse::{CacheStats, CacheWarehouse, WarehouseConfig, WarehouseError};
