//! Conversions between domain values and their stored column forms.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::DatabaseError;

/// Fixed-width RFC 3339 so that string order matches time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(ts)
}

pub(crate) fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode {
            column,
            reason: format!("'{}': {}", raw, e),
        })
}

pub(crate) fn parse_opt_ts(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.map(|r| parse_ts(column, &r)).transpose()
}

pub(crate) fn to_json<T: Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Decode {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn from_json<T: DeserializeOwned>(column: &'static str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Decode {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn from_opt_json<T: DeserializeOwned>(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    raw.map(|r| from_json(column, &r)).transpose()
}

/// Parses an enum stored by its `as_str` form.
pub(crate) fn parse_enum<T>(column: &'static str, raw: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|reason| DatabaseError::Decode { column, reason })
}

/// SQLite integers are signed; counters are clamped rather than wrapped.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(column: &'static str, value: i64) -> Result<u64, DatabaseError> {
    u64::try_from(value).map_err(|_| DatabaseError::Decode {
        column,
        reason: format!("negative value {}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts("created_at", &ts(&b)).unwrap(), b);
    }

    #[test]
    fn test_parse_errors_name_the_column() {
        let err = parse_ts("started_at", "yesterday").unwrap_err();
        assert!(err.to_string().contains("started_at"));
        assert!(to_u64("file_size", -1).is_err());
    }
}
