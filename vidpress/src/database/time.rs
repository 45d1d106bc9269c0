//! Timestamp helpers. Every timestamp column holds Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

/// Current time as epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds into a `DateTime<Utc>`, clamping values chrono
/// cannot represent.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None if ms.is_negative() => DateTime::<Utc>::MIN_UTC,
        chrono::LocalResult::None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Whether a record created at `created_ms` is older than `ttl_ms` at `now`.
#[inline]
pub fn is_expired(created_ms: i64, ttl_ms: i64, now: i64) -> bool {
    now.saturating_sub(created_ms) >= ttl_ms
}
