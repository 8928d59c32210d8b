//! Local-time rules: the fixed attendance time zone, event timestamp parsing,
//! day grouping and work-hour arithmetic.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use thiserror::Error;

/// Default attendance zone, UTC+7.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 7;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeError {
    #[error("unparseable timestamp: {0}")]
    Unparseable(String),
    #[error("utc offset out of range: {0}h")]
    OffsetOutOfRange(i32),
}

/// The fixed local zone used to key attendance by calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalZone {
    offset: FixedOffset,
}

impl LocalZone {
    pub fn from_hours(hours: i32) -> Result<Self, TimeError> {
        hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .map(|offset| Self { offset })
            .ok_or(TimeError::OffsetOutOfRange(hours))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Re-express an instant in the local zone.
    pub fn localize<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }

    /// Local calendar day of an instant: the grouping key for sessions.
    pub fn day_of<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> NaiveDate {
        self.localize(instant).date_naive()
    }

    /// Parse a client-supplied event timestamp.
    ///
    /// A `Z` designator or explicit offset is honoured; a timestamp without
    /// one is taken as local time. The result is expressed in the local zone.
    pub fn parse_timestamp(&self, raw: &str) -> Result<DateTime<FixedOffset>, TimeError> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(self.localize(&dt));
        }

        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .and_then(|naive| self.offset.from_local_datetime(&naive).single())
            .ok_or_else(|| TimeError::Unparseable(raw.to_string()))
    }
}

impl Default for LocalZone {
    fn default() -> Self {
        Self::from_hours(DEFAULT_UTC_OFFSET_HOURS).unwrap_or(Self { offset: Utc.fix() })
    }
}

/// Source of "now" for operations that do not carry a client timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Elapsed hours between two instants, rounded to two decimal places.
pub fn work_hours(check_in: &DateTime<FixedOffset>, check_out: &DateTime<FixedOffset>) -> f64 {
    let seconds = (*check_out - *check_in).num_milliseconds() as f64 / 1000.0;
    round2(seconds / 3600.0)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
