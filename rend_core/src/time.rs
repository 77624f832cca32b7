//! Wall-clock deadlines as unix nanoseconds.
//!
//! Deadlines are persisted next to each record, so they use absolute
//! wall-clock time rather than a monotonic clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the unix epoch; zero for pre-epoch times.
pub fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The current wall-clock time in unix nanoseconds.
pub fn now_nanos() -> u64 {
    unix_nanos(SystemTime::now())
}

/// The absolute deadline `now + ttl`, saturating.
pub fn deadline_nanos(now: SystemTime, ttl: Duration) -> u64 {
    unix_nanos(now).saturating_add(ttl.as_nanos().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_adds_ttl() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(
            deadline_nanos(now, Duration::from_secs(5)),
            105_000_000_000
        );
        assert_eq!(deadline_nanos(now, Duration::ZERO), 100_000_000_000);
    }
}
