use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Remote entity addressed by a stable numeric id.
///
/// The id is the key for deduplication and caching. The symbol is carried for display only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawEntity")]
pub struct EntityRef {
    id: i64,
    symbol: String,
}

#[derive(Deserialize)]
struct RawEntity {
    id: i64,
    symbol: String,
}

impl TryFrom<RawEntity> for EntityRef {
    type Error = ConfigError;

    fn try_from(value: RawEntity) -> Result<Self, Self::Error> {
        Self::new(value.id, value.symbol)
    }
}

impl EntityRef {
    pub fn new(id: i64, symbol: impl Into<String>) -> Result<Self, ConfigError> {
        if id < 0 {
            return Err(ConfigError::NegativeEntityId { id });
        }

        let symbol = symbol.into();
        let trimmed = symbol.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptySymbol { id });
        }

        Ok(Self {
            id,
            symbol: trimmed.to_owned(),
        })
    }

    /// Parse the `ID:SYMBOL` form used on the command line.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEntitySpec {
            value: input.to_owned(),
        };

        let (id, symbol) = input.split_once(':').ok_or_else(invalid)?;
        let id = id.trim().parse::<i64>().map_err(|_| invalid())?;
        Self::new(id, symbol)
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.symbol)
    }
}
