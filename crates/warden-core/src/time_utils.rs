/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `created_unix` is at least `max_age_seconds` in the past.
///
/// Saturates on clock regression so an entry created "in the future" is never
/// reported as aged out.
pub fn is_older_than(created_unix: u64, max_age_seconds: u64, now_unix: u64) -> bool {
    now_unix.saturating_sub(created_unix) >= max_age_seconds
}
