//! Timestamp normalisation and epoch-day bucketing.
//!
//! Stored timestamps are RFC3339 UTC with exactly three fractional digits
//! (`2026-10-15T08:30:00.000Z`). Fixed width means string order is time order,
//! which the range filters and retention cutoffs rely on.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Error, Result};

const SECONDS_PER_DAY: i64 = 86_400;

/// Format an instant in the storage representation.
#[must_use]
pub fn to_storage(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse any RFC3339 timestamp into UTC.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("timestamp {s:?} is not RFC3339: {e}")))
}

/// Re-encode a caller-supplied RFC3339 timestamp in storage form.
pub fn normalize(s: &str) -> Result<String> {
    parse_rfc3339(s).map(to_storage)
}

/// Days since the Unix epoch of the UTC calendar day containing `t`.
///
/// Time of day never affects the result, and instants before 1970 land in
/// negative buckets rather than rounding toward zero.
#[must_use]
pub fn days_since_epoch(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(SECONDS_PER_DAY)
}

/// Midnight UTC of an epoch day.
#[must_use]
pub fn epoch_day_start(day: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(day.checked_mul(SECONDS_PER_DAY)?, 0).single()
}
