//! Quote source contract and the failure taxonomy shared by adapters and the retry loop.
//!
//! # Error classes
//!
//! | Kind | Retried | Final status |
//! |------|---------|--------------|
//! | [`ErrorKind::Timeout`] | yes | `error` |
//! | [`ErrorKind::NetworkError`] | yes | `error` |
//! | [`ErrorKind::ServerError`] | yes | `error` |
//! | [`ErrorKind::RateLimited`] | yes, after the limiter cooldown | `error` |
//! | [`ErrorKind::ClientError`] | no | `invalid` |
//! | [`ErrorKind::MalformedPayload`] | no | `invalid` |

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::domain::{EntityRef, FetchWindow, QuotePoint};

/// Classification of a single failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ServerError,
    RateLimited,
    ClientError,
    MalformedPayload,
    NetworkError,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::ClientError => "client_error",
            Self::MalformedPayload => "malformed_payload",
            Self::NetworkError => "network_error",
        }
    }

    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::ClientError | Self::MalformedPayload)
    }

    /// Failures that say the transport itself is unhealthy.
    pub const fn is_transport(self) -> bool {
        matches!(self, Self::Timeout | Self::NetworkError)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured fetch error produced at the source boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    kind: ErrorKind,
    message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, message)
    }

    pub fn malformed_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedPayload, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::Timeout => "fetch.timeout",
            ErrorKind::ServerError => "fetch.server_error",
            ErrorKind::RateLimited => "fetch.rate_limited",
            ErrorKind::ClientError => "fetch.client_error",
            ErrorKind::MalformedPayload => "fetch.malformed_payload",
            ErrorKind::NetworkError => "fetch.network_error",
        }
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for FetchError {}

/// One outbound call: a set of entities over a shared window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub entities: Vec<EntityRef>,
    pub window: FetchWindow,
}

impl QuoteRequest {
    pub fn new(entities: Vec<EntityRef>, window: FetchWindow) -> Self {
        Self { entities, window }
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entities.iter().map(EntityRef::id)
    }
}

/// Per-id outcomes of one call.
///
/// Ids absent from the map had no data in the window. An `Err` marks an id the provider answered
/// for but that could not be turned into a quote; it fails alone while its siblings keep their
/// quotes.
pub type QuoteBatch = HashMap<i64, Result<QuotePoint, FetchError>>;

/// Remote quote provider contract.
///
/// A call that fails as a whole returns `Err`. A call that gets an answer returns a
/// [`QuoteBatch`] with one outcome per id. The engine owns rate limiting, retries and caching,
/// so implementations only translate one request into one remote call and classify what comes
/// back.
pub trait QuoteSource: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Largest number of ids one call may carry. `1` means one entity per call.
    fn max_ids_per_request(&self) -> usize {
        1
    }

    fn fetch_quotes<'a>(
        &'a self,
        request: QuoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<QuoteBatch, FetchError>> + Send + 'a>>;
}
