//! CLI argument definitions for tokenfetch.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fetch` | Fetch quotes for a batch of entities over a date window |
//! | `cache stats` | Show what the persistent cache holds |
//! | `cache clear` | Drop every cached record |
//!
//! # Examples
//!
//! ```bash
//! # Two tokens, pretty JSON report
//! tokenfetch fetch --start 2024-01-01 --end 2024-01-31 --entity 1:BTC --entity 1027:ETH --pretty
//!
//! # A whole list from a file, NDJSON output, two extra passes for failures
//! tokenfetch --format ndjson fetch --start 2024-01-01 --end 2024-01-31 --input tokens.json --retry-failed 2
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Rate-limited batch quote fetcher for CoinMarketCap.
///
/// Reports go to stdout, logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "tokenfetch", author, version, about)]
pub struct Cli {
    /// Output format for reports.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log filter used when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Single JSON document.
    Json,
    /// One JSON object per line, tagged by `type`.
    Ndjson,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch quotes for a batch of entities.
    Fetch(FetchArgs),
    /// Inspect or clear the persistent cache.
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// First day of the window (YYYY-MM-DD).
    #[arg(long)]
    pub start: String,

    /// Last day of the window (YYYY-MM-DD). Future dates are clamped.
    #[arg(long)]
    pub end: String,

    /// Entity as ID:SYMBOL. Repeatable.
    #[arg(long = "entity", value_name = "ID:SYMBOL")]
    pub entities: Vec<String>,

    /// JSON file holding an array of `{"id": .., "symbol": ..}` objects.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Extra passes over failed and cancelled entities.
    #[arg(long, default_value_t = 0)]
    pub retry_failed: u32,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

/// Overrides for the provider policy. Unset flags keep the provider default.
#[derive(Debug, Clone, Default, Args)]
pub struct TuningArgs {
    /// Concurrent worker tasks.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum ids per request.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Requests allowed per rolling window.
    #[arg(long)]
    pub max_requests: Option<u32>,

    /// Rolling window length in seconds.
    #[arg(long)]
    pub window_secs: Option<u64>,

    /// Pause after the provider reports quota exhaustion, in seconds.
    #[arg(long)]
    pub cooldown_secs: Option<u64>,

    /// Attempts per request for transient failures.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Cache entry lifetime in seconds.
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Space requests evenly across the window.
    #[arg(long, default_value_t = false)]
    pub pace: bool,

    /// Skip the persistent cache for this run.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,

    /// Use the offline transport instead of the network. Every entity ends as `no_data`.
    #[arg(long, default_value_t = false)]
    pub offline: bool,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum CacheCommand {
    /// Show entry count, age range and database location.
    Stats,
    /// Delete every cached record.
    Clear,
}
