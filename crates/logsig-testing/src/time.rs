//! Deterministic time control for block time limits and request timeouts.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use logsig_core::Clock;

/// Test clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the signer.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since start
    monotonic_ns: Arc<AtomicU64>,
    /// System time as seconds since UNIX_EPOCH
    system_secs: Arc<AtomicU64>,
    /// Base instant for monotonic time calculations
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_secs: Arc::new(AtomicU64::new(since_epoch.as_secs())),
            base_instant: Instant::now(),
        }
    }

    /// Current instant in test time.
    pub fn now_instant(&self) -> Instant {
        let elapsed_ns = self.monotonic_ns.load(Ordering::Acquire);
        self.base_instant + Duration::from_nanos(elapsed_ns)
    }

    /// Current system time.
    pub fn now_system(&self) -> SystemTime {
        let secs = self.system_secs.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// Advances both clocks.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.monotonic_ns.fetch_add(nanos, Ordering::AcqRel);
        self.system_secs.fetch_add(duration.as_secs(), Ordering::AcqRel);
    }

    /// Jumps the system clock to `time`; the monotonic clock never goes back.
    pub fn jump_to(&self, time: SystemTime) {
        let target_secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let current_secs = self.system_secs.load(Ordering::Acquire);

        if target_secs > current_secs {
            self.advance(Duration::from_secs(target_secs - current_secs));
        } else {
            self.system_secs.store(target_secs, Ordering::Release);
        }
    }

    /// Time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.now_instant()
    }

    fn now_system(&self) -> SystemTime {
        TestClock::now_system(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_000));
        let handle = clock.clone();

        handle.advance(Duration::from_secs(30));
        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(1_030));
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn jump_backwards_keeps_monotonic_time() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(500));
        let before = clock.now_instant();

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.now_instant(), before);
    }
}
