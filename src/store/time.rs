//! Timestamp conventions for queue columns.
//!
//! Timestamps are stored as RFC 3339 TEXT with fixed microsecond precision
//! and a `Z` suffix, so that lexicographic comparison in SQL orders
//! chronologically. All comparisons within one store call derive from a
//! single captured `now`, keeping every age computation on one clock.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage and comparison.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}
