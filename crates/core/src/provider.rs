//! Time and id sources.
//!
//! Every component that samples the current time or mints correlation ids
//! takes one of these by `Arc`, so tests and the simulator can drive time
//! explicitly.

use crate::id::CorrelationId;
use crate::Time;
use parking_lot::Mutex;

/// Source of the current (local) time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> Time;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Time>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Time) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

/// Source of correlation ids.
pub trait IdGenerator: Send + Sync {
    /// A correlation id never handed out before in this process.
    fn next_correlation_id(&self) -> CorrelationId;
}

/// ULID-based generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::milliseconds(5001));
        assert_eq!(clock.now() - start, Duration::milliseconds(5001));
    }

    #[test]
    fn ulid_generator_is_unique() {
        let ids = UlidGenerator;
        let a = ids.next_correlation_id();
        let b = ids.next_correlation_id();
        assert_ne!(a, b);
    }
}
