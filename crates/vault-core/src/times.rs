//! Timestamp helpers
//!
//! The container stores timestamps as microseconds since the Unix epoch, so
//! every timestamp the model produces is truncated to microsecond precision
//! up front. This keeps an in-memory database byte-equal with its own
//! encode/decode round trip.

use chrono::{DateTime, Utc};

/// Current time, truncated to microsecond precision.
pub fn now() -> DateTime<Utc> {
    from_micros(Utc::now().timestamp_micros()).unwrap_or_default()
}

/// Microseconds since the Unix epoch.
pub fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Rebuild a timestamp from stored microseconds.
pub fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
}
