//! Injectable clock for deterministic time.
//!
//! Every time-sensitive component (pipeline, schedulers, worker) takes a
//! `Clock` rather than calling `Utc::now()` directly, so tests can supply a
//! fixed or steppable time source.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A source of "now", always in UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock, backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convenience alias used throughout constructor signatures.
pub type SharedClock = Arc<dyn Clock>;

/// Returns the system clock as a shared handle.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock pinned to a fixed instant, steppable from tests.
    pub struct FixedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        pub fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(FixedClock {
                now: Mutex::new(now),
            })
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += delta;
        }

        pub fn set(&self, instant: DateTime<Utc>) {
            *self.now.lock().unwrap() = instant;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FixedClock;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_returns_pinned_instant() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::at(instant);
        assert_eq!(clock.now(), instant);
    }

    #[test]
    fn fixed_clock_advances() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::at(instant);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), instant + chrono::Duration::minutes(5));
    }
}
