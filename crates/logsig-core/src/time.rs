//! Time abstractions for testable block timing.
//!
//! Block start times, block time limits and request timeouts all read the
//! wall clock through [`Clock`], so tests can move time forward without
//! sleeping.

use std::time::{Instant, SystemTime};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests can inject controllable
/// implementations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;
}

/// Real clock implementation using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn real_clock_moves_forward() {
        let clock = RealClock::new();
        let start = clock.now();
        let wall = clock.now_system();

        std::thread::sleep(Duration::from_millis(2));

        assert!(clock.now() > start);
        assert!(clock.now_system() >= wall);
    }
}
