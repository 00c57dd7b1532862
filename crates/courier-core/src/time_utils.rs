use chrono::{DateTime, Duration, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Converts a Unix millisecond timestamp into a UTC datetime.
pub fn unix_ms_to_datetime(unix_ms: u64) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(unix_ms).ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Converts a configured minute count into a chrono duration, saturating on overflow.
pub fn minutes_to_duration(minutes: u64) -> Duration {
    let minutes = i64::try_from(minutes).unwrap_or(i64::MAX / 60_000);
    Duration::try_minutes(minutes).unwrap_or(Duration::MAX)
}
