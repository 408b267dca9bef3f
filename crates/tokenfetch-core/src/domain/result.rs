use serde::{Deserialize, Serialize};

use super::EntityRef;

/// Final classification of one entity in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// A quote was fetched.
    Ok,
    /// The provider answered but had no record for the entity.
    NoData,
    /// The provider rejected the request or returned an unusable payload.
    Invalid,
    /// Retries were exhausted or the transport is down.
    Error,
}

impl FetchStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoData => "no_data",
            Self::Invalid => "invalid",
            Self::Error => "error",
        }
    }

    /// Terminal successes are the only outcomes worth remembering.
    pub const fn is_cacheable(self) -> bool {
        matches!(self, Self::Ok | Self::NoData)
    }
}

/// Latest value observed for one entity inside the requested window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotePoint {
    pub price: f64,
    pub market_cap: Option<f64>,
}

/// Per-entity record produced by a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    entity: EntityRef,
    price: Option<f64>,
    market_cap: Option<f64>,
    status: FetchStatus,
}

impl FetchResult {
    pub fn ok(entity: EntityRef, quote: QuotePoint) -> Self {
        Self {
            entity,
            price: Some(quote.price),
            market_cap: quote.market_cap,
            status: FetchStatus::Ok,
        }
    }

    pub fn no_data(entity: EntityRef) -> Self {
        Self {
            entity,
            price: None,
            market_cap: None,
            status: FetchStatus::NoData,
        }
    }

    /// Value-less result for an entity that ended as `Invalid` or `Error`.
    pub fn failed(entity: EntityRef, status: FetchStatus) -> Self {
        Self {
            entity,
            price: None,
            market_cap: None,
            status,
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub const fn price(&self) -> Option<f64> {
        self.price
    }

    pub const fn market_cap(&self) -> Option<f64> {
        self.market_cap
    }

    pub const fn status(&self) -> FetchStatus {
        self.status
    }
}
