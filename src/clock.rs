//! Wall-clock access for scheduling decisions.
//!
//! Scores in the scheduled/retry/dead sets and every descriptor timestamp are
//! unix seconds as `f64`. The runtime reads "now" through [`Clock`] so the
//! poller and retry handler can be driven by a [`ManualClock`] in tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current unix time in (fractional) seconds.
    fn now(&self) -> f64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        epoch_seconds(Utc::now())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start` unix seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Creates a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by.as_secs_f64();
    }

    /// Sets the clock to an absolute unix time.
    pub fn set(&self, at: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Converts a UTC timestamp to fractional unix seconds.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Formats the UTC day containing `at` as `YYYY-MM-DD`, the suffix of the
/// per-day statistics keys.
pub fn day_stamp(at: f64) -> String {
    let secs = at.floor() as i64;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_and_set() {
        let clock = ManualClock::new(1_000.0);
        assert_eq!(clock.now(), 1_000.0);

        clock.advance(Duration::from_millis(1_500));
        assert!((clock.now() - 1_001.5).abs() < f64::EPSILON);

        clock.set(42.0);
        assert_eq!(clock.now(), 42.0);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(10.0);
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(other.now(), 15.0);
    }

    #[test]
    fn test_day_stamp() {
        // 2024-03-01T12:00:00Z
        assert_eq!(day_stamp(1_709_294_400.0), "2024-03-01");
        assert_eq!(day_stamp(0.0), "1970-01-01");
    }

    #[test]
    fn test_system_clock_is_recent() {
        // Anything after 2020-01-01 is good enough.
        assert!(SystemClock.now() > 1_577_836_800.0);
    }
}
