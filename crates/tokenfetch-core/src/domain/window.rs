use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::ConfigError;

/// Bounds a provider can actually serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Earliest date with any data.
    pub min_date: Date,
    /// Days between "today" and the newest ingested record.
    pub ingestion_lag_days: u16,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            min_date: Date::from_calendar_date(2013, Month::April, 28).unwrap_or(Date::MIN),
            ingestion_lag_days: 1,
        }
    }
}

impl WindowPolicy {
    /// Latest date the provider can answer for, given the current date.
    pub fn latest_available(&self, today: Date) -> Date {
        today
            .checked_sub(Duration::days(i64::from(self.ingestion_lag_days)))
            .unwrap_or(self.min_date)
            .max(self.min_date)
    }
}

/// Inclusive date range to fetch, always with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "WindowRepr", try_from = "WindowRepr")]
pub struct FetchWindow {
    start: Date,
    end: Date,
}

#[derive(Serialize, Deserialize)]
struct WindowRepr {
    start: String,
    end: String,
}

impl From<FetchWindow> for WindowRepr {
    fn from(value: FetchWindow) -> Self {
        Self {
            start: format_date(value.start),
            end: format_date(value.end),
        }
    }
}

impl TryFrom<WindowRepr> for FetchWindow {
    type Error = ConfigError;

    fn try_from(value: WindowRepr) -> Result<Self, Self::Error> {
        Self::parse(&value.start, &value.end)
    }
}

impl FetchWindow {
    pub fn new(start: Date, end: Date) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::WindowInverted {
                start: format_date(start),
                end: format_date(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds without clamping.
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// Parse and clamp against the provider bounds as of the current UTC date.
    pub fn resolve(start: &str, end: &str, policy: &WindowPolicy) -> Result<Self, ConfigError> {
        Self::resolve_at(start, end, OffsetDateTime::now_utc().date(), policy)
    }

    /// Parse and clamp both bounds into `[policy.min_date, latest available]`.
    ///
    /// Inverted input is rejected before clamping, so a clamped window never hides a typo.
    pub fn resolve_at(
        start: &str,
        end: &str,
        today: Date,
        policy: &WindowPolicy,
    ) -> Result<Self, ConfigError> {
        let requested = Self::parse(start, end)?;
        let latest = policy.latest_available(today);
        let clamp = |date: Date| date.clamp(policy.min_date, latest);

        Ok(Self {
            start: clamp(requested.start),
            end: clamp(requested.end),
        })
    }

    pub const fn start(&self) -> Date {
        self.start
    }

    pub const fn end(&self) -> Date {
        self.end
    }

    pub fn start_str(&self) -> String {
        format_date(self.start)
    }

    pub fn end_str(&self) -> String {
        format_date(self.end)
    }
}

impl Display for FetchWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_str(), self.end_str())
    }
}

fn parse_date(value: &str) -> Result<Date, ConfigError> {
    let invalid = || ConfigError::InvalidDate {
        value: value.to_owned(),
    };

    let mut parts = value.trim().splitn(3, '-');
    let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return Err(invalid());
    }

    let year = year.parse::<i32>().map_err(|_| invalid())?;
    let month = month
        .parse::<u8>()
        .ok()
        .and_then(|month| Month::try_from(month).ok())
        .ok_or_else(invalid)?;
    let day = day.parse::<u8>().map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
