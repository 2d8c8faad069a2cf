use std::time::{self, Duration};

/// Milliseconds since the Unix epoch.
///
/// Saturates to zero if the system clock is set before the epoch, which
/// only shifts dedup windows instead of aborting a live set.
#[must_use]
pub fn now_millis() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
