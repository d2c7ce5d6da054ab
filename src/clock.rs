//! Injectable Clock
//!
//! Scheduler, orchestrator and gate read time only through [`Clock`], so tests can
//! pin "now" exactly.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Only moves forward: `advance_to` panics on backward movement in debug builds.
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    pub fn advance_to(&self, new_time: DateTime<Utc>) {
        let mut current = self.current.write();
        debug_assert!(
            new_time >= *current,
            "ManualClock: cannot go backward from {} to {}",
            *current,
            new_time
        );
        *current = new_time;
    }

    pub fn advance_by(&self, delta: Duration) {
        debug_assert!(delta >= Duration::zero(), "ManualClock: negative delta");
        let mut current = self.current.write();
        *current += delta;
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_by(Duration::minutes(30));
        assert_eq!(clock.now(), start + Duration::minutes(30));

        clock.advance_to(start + Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
    }

    #[test]
    #[should_panic(expected = "cannot go backward")]
    #[cfg(debug_assertions)]
    fn test_manual_clock_rejects_backward() {
        let start = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance_to(start - Duration::seconds(1));
    }
}
