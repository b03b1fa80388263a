use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Unix seconds. The store rows and every wire format carry second
/// precision.
pub fn now_secs() -> i64 {
    since_epoch().as_secs() as i64
}

/// Unix milliseconds, used by the session timers.
pub fn now_millis() -> i64 {
    since_epoch().as_millis() as i64
}

/// Nanosecond reading for unique temp-file names.
pub fn now_nanos() -> u128 {
    since_epoch().as_nanos()
}
