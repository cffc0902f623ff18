use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Source of wall-clock time for the engine.
///
/// Handlers never read this directly; they go through `Context::now`, which
/// journals the value so replays observe the same instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and dry runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = add_duration(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Latest instant the engine stores: 9999-12-31T23:59:59.999Z.
///
/// Timestamps are compared as RFC 3339 text, which only sorts correctly for
/// four-digit years.
pub fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(253_402_300_799_999).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `instant + by`, saturating at [`far_future`].
pub fn add_duration(instant: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .map_or_else(far_future, |later| later.min(far_future()))
}

/// `later - earlier` as a std duration, zero when `later` is not after `earlier`.
pub fn duration_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + TimeDelta::seconds(90));
    }

    #[test]
    fn huge_durations_saturate_at_a_sortable_instant() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let saturated = add_duration(start, Duration::MAX);
        assert_eq!(saturated, far_future());
        assert_eq!(
            add_duration(start, Duration::from_secs(10_000 * 366 * 24 * 3600)),
            far_future()
        );
        assert_eq!(
            crate::store::ts(saturated),
            "9999-12-31T23:59:59.999Z"
        );
        assert!(crate::store::ts(saturated) > crate::store::ts(start));
    }

    #[test]
    fn duration_between_never_goes_negative() {
        let a = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let b = a + TimeDelta::minutes(5);
        assert_eq!(duration_between(a, b), Duration::from_secs(300));
        assert_eq!(duration_between(b, a), Duration::ZERO);
    }
}
