//! Deterministic time control for reproducible timing tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use surety_core::Clock;

/// Test clock with manually advanced monotonic and wall-clock time.
///
/// Both domains move together under [`advance`](Self::advance), so a test
/// that rolls the sweeper gate forward also moves the timestamps the store
/// would persist.
#[derive(Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since start.
    monotonic_ns: Arc<AtomicU64>,
    /// Wall-clock time as milliseconds since `UNIX_EPOCH`.
    epoch_ms: Arc<AtomicU64>,
    /// Base instant for monotonic calculations.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            epoch_ms: Arc::new(AtomicU64::new(
                u64::try_from(since_epoch.as_millis()).unwrap_or(0),
            )),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.monotonic_ns.fetch_add(
            u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0),
            Ordering::AcqRel,
        );
        self.epoch_ms.fetch_add(
            u64::try_from(duration.as_millis().min(u128::from(u64::MAX))).unwrap_or(0),
            Ordering::AcqRel,
        );
    }

    /// Elapsed virtual time since clock creation.
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
        let elapsed_ns = self.monotonic_ns.load(Ordering::Acquire);
        self.base_instant + Duration::from_nanos(elapsed_ns)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::Acquire);
        DateTime::from_timestamp_millis(i64::try_from(ms).unwrap_or(0)).unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Virtual sleep: advance the clock and yield so other tasks run.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_monotonically() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn timestamps_follow_advances() {
        let clock = TestClock::new();
        let before = clock.now_utc();

        clock.advance(Duration::from_millis(2500));

        assert_eq!(clock.now_utc() - before, chrono::Duration::milliseconds(2500));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }
}
