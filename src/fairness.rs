//! Time keeping and service statistics for the fair combining locks.

use std::time::Instant;

/// A monotonic nanosecond clock anchored at lock creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Nanoseconds elapsed since the clock was created, saturating.
    pub(crate) fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Lock wide statistics of the critical sections a combiner executed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ServiceStats {
    average: i64,
    executed: u64,
}

impl ServiceStats {
    /// Folds one critical section duration into the running average.
    pub(crate) fn record(&mut self, elapsed: u64) {
        self.executed += 1;
        let sample = i64::try_from(elapsed).unwrap_or(i64::MAX);
        let executed = i64::try_from(self.executed).unwrap_or(i64::MAX);
        self.average += (sample - self.average) / executed;
    }

    /// Running average duration of an executed critical section.
    pub(crate) fn average(&self) -> u64 {
        u64::try_from(self.average).unwrap_or(0)
    }

    /// Number of critical sections recorded.
    #[cfg(all(not(loom), test))]
    pub(crate) fn executed(&self) -> u64 {
        self.executed
    }

    /// Returns when a participant whose critical section took `elapsed` and
    /// finished at `end` may be served again, with `waiting` threads
    /// competing for the lock.
    ///
    /// The ban grows with the time taken away from the other waiters and
    /// shrinks by the running average, so participants with average sized
    /// critical sections are barely held back.
    pub(crate) fn ban_until(&self, end: u64, elapsed: u64, waiting: usize) -> u64 {
        let waiting = u64::try_from(waiting).unwrap_or(u64::MAX);
        let penalty = elapsed.saturating_mul(waiting).saturating_sub(self.average());
        end.saturating_add(penalty)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Clock, ServiceStats};

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn running_average() {
        let mut stats = ServiceStats::default();
        stats.record(100);
        assert_eq!(stats.average(), 100);
        stats.record(300);
        assert_eq!(stats.average(), 200);
        stats.record(200);
        assert_eq!(stats.average(), 200);
        assert_eq!(stats.executed(), 3);
    }

    #[test]
    fn ban_scales_with_waiters() {
        let mut stats = ServiceStats::default();
        stats.record(100);
        // Alone, an average critical section earns no ban.
        assert_eq!(stats.ban_until(1_000, 100, 1), 1_000);
        // With four waiters it costs the other three their share.
        assert_eq!(stats.ban_until(1_000, 100, 4), 1_300);
        // Long critical sections are banned for longer.
        assert_eq!(stats.ban_until(1_000, 1_000, 4), 4_900);
    }

    #[test]
    fn ban_never_goes_backwards() {
        let mut stats = ServiceStats::default();
        stats.record(10_000);
        assert_eq!(stats.ban_until(500, 10, 2), 500);
        assert_eq!(stats.ban_until(u64::MAX - 1, u64::MAX, 8), u64::MAX);
    }
}
