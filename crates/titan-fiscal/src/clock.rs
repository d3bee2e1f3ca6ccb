//! Wall-clock source for queue timestamps.
//!
//! The dispatcher reads the clock at every transition (claim, build,
//! reschedule, completion) so stored times reflect when each step happened,
//! not when the batch started.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Follows the system clock until set, then only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockClock {
    fixed: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

#[cfg(test)]
impl MockClock {
    pub fn set(&self, at: DateTime<Utc>) {
        *self.fixed.lock() = Some(at);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut fixed = self.fixed.lock();
        let base = fixed.unwrap_or_else(Utc::now);
        *fixed = Some(base + by);
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.fixed.lock().unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_freezes_once_set() {
        let clock = MockClock::default();
        let t0 = Utc::now() - chrono::Duration::days(1);

        clock.set(t0);
        assert_eq!(clock.now(), t0);
        assert_eq!(clock.now(), t0);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), t0 + chrono::Duration::seconds(90));
    }
}
