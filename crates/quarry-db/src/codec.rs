//! Column encodings shared by the table modules.
//!
//! Timestamps are stored as RFC 3339 text with a fixed microsecond precision
//! and a `Z` suffix, so lexicographic order in SQL matches time order.

use crate::error::{DatabaseError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use quarry_core::{EntityId, ProviderId};

/// Encode a timestamp; anything past year 9999 is stored as `latest_ts()`.
pub(crate) fn encode_ts(at: &DateTime<Utc>) -> String {
    (*at).min(latest_ts()).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Latest timestamp whose encoding still sorts after every four-digit year.
pub(crate) fn latest_ts() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).expect("9999-12-31T23:59:59Z is representable")
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode(format!("invalid timestamp '{raw}': {e}")))
}

pub(crate) fn decode_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(decode_ts).transpose()
}

pub(crate) fn decode_entity_id(raw: String) -> Result<EntityId> {
    EntityId::new(raw).map_err(|e| DatabaseError::Decode(e.to_string()))
}

pub(crate) fn decode_provider_id(raw: String) -> Result<ProviderId> {
    ProviderId::new(raw).map_err(|e| DatabaseError::Decode(e.to_string()))
}

/// Stored counters are `INTEGER`; saturate rather than wrap.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
