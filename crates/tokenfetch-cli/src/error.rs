use std::path::PathBuf;

use thiserror::Error;
use tokenfetch_core::{CacheError, ConfigError, CoreError};

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("command error: {0}")]
    Command(String),

    #[error("input file {} is not a list of {{id, symbol}} rows: {source}", path.display())]
    InvalidInput {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::Core(CoreError::Config(error))
    }
}

impl From<CacheError> for CliError {
    fn from(error: CacheError) -> Self {
        Self::Core(CoreError::Cache(error))
    }
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Core(CoreError::Config(_)) => 2,
            Self::Core(CoreError::Cache(_)) => 10,
            Self::Core(CoreError::Serialization(_)) => 4,
            Self::Command(_) => 2,
            Self::InvalidInput { .. } => 2,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
