//! Time sources for the limiters.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a clone handed to a limiter
/// can be advanced from a test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a manual clock fixed at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a manual clock fixed at the given Unix time in milliseconds.
    pub fn from_unix_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move the clock to `instant`. Moving backwards is allowed.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    /// Move the clock forward by `step`.
    pub fn advance(&self, step: std::time::Duration) {
        let step = ChronoDuration::from_std(step).unwrap_or(ChronoDuration::zero());
        let mut now = self.now.lock();
        *now += step;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Seconds from `earlier` to `later` as a float. Negative when the clock went backwards.
pub(crate) fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later.signed_duration_since(earlier);
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::from_unix_millis(1_000);
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now().timestamp_millis(), 2_500);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::from_unix_millis(0);
        let shared = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(shared.now().timestamp(), 3);
    }

    #[test]
    fn test_seconds_between_negative_when_backwards() {
        let a = DateTime::from_timestamp_millis(10_000).unwrap();
        let b = DateTime::from_timestamp_millis(9_500).unwrap();
        assert_eq!(seconds_between(a, b), -0.5);
        assert_eq!(seconds_between(b, a), 0.5);
    }
}
