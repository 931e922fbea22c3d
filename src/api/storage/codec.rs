//! Column encoding shared by the SQL backends.

use super::StorageError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {:?}: {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(parse_ts).transpose()
}

pub(crate) fn parse_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw)
        .map_err(|e| StorageError::Serialization(format!("invalid {}: {}", what, e)))
}

/// Counters are stored as signed integers; negatives never round-trip.
pub(crate) fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}
