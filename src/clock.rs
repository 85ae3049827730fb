use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Clock is our interface for a type that can be used to tell the time. Kept
/// minimal so the moving average store can be driven explicitly in tests.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Real clock backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manipulable clock for tests.
pub struct MockClock {
    base_time: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(t: DateTime<Utc>) -> MockClock {
        MockClock {
            base_time: Mutex::new(t),
        }
    }

    /// Set the time returned by the clock.
    pub fn set(&self, t: DateTime<Utc>) {
        *self.base_time.lock() = t;
    }

    /// Advance the clock by the given duration.
    pub fn add(&self, d: chrono::Duration) {
        let mut t = self.base_time.lock();
        *t += d;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.base_time.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mock_clock_set_and_add() {
        let start = Utc.with_ymd_and_hms(2018, 12, 11, 14, 46, 44).unwrap();
        let clock = MockClock::new(start);
        assert_eq!(clock.now(), start);

        clock.add(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));

        let later = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
