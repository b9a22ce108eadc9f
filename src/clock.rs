use chrono::Utc;

/// Milliseconds since the Unix epoch, UTC.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
