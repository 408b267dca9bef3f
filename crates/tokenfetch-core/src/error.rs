use thiserror::Error;

use crate::cache::CacheError;

/// Invalid batch input or engine settings. Always fatal for the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("date must be formatted as YYYY-MM-DD: '{value}'")]
    InvalidDate { value: String },
    #[error("window start {start} is after window end {end}")]
    WindowInverted { start: String, end: String },

    #[error("entity id must be non-negative: {id}")]
    NegativeEntityId { id: i64 },
    #[error("entity {id} has an empty symbol")]
    EmptySymbol { id: i64 },
    #[error("entity must be formatted as ID:SYMBOL: '{value}'")]
    InvalidEntitySpec { value: String },
    #[error("entity list cannot be empty")]
    EmptyEntityList,

    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("rate budget needs at least one request per non-empty window")]
    InvalidRateBudget,
    #[error("max attempts must be at least 1")]
    ZeroAttempts,
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
