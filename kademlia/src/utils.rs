/// Seconds since the unix epoch.
pub type Timestamp = i64;

/// Returns the current time as a unix timestamp, in seconds.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}
