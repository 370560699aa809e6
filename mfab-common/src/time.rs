//! Timestamp utilities

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Microseconds per second
pub const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert fractional seconds to whole microseconds (rounded)
pub fn seconds_to_micros(seconds: f64) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * MICROS_PER_SECOND).round() as u64
}

/// Offset a timestamp by a number of microseconds
pub fn plus_micros(at: DateTime<Utc>, micros: u64) -> DateTime<Utc> {
    at + ChronoDuration::microseconds(micros as i64)
}

/// Seconds elapsed from `from` until `to` (negative if `to` is earlier)
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / MICROS_PER_SECOND
}
