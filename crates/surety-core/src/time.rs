//! Time sources for the worker engine.
//!
//! The engine lives in two time domains: a monotonic one for tick pacing,
//! claim-duration measurement, and the sweeper's second gate, and a UTC one
//! for everything the store persists (`retry_at`, lock stamps, terminal
//! timestamps). [`Clock`] names exactly those two, plus the async sleep the
//! tick loop parks on, so tests can drive all three deterministically.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// The worker engine's time source.
///
/// Production code uses [`RealClock`]; tests inject a virtual clock and
/// advance it by hand.
pub trait Clock: Send + Sync {
    /// Monotonic reading for measuring cycle and claim durations and for
    /// gating the sweeper. Never goes backwards.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp written to the store, e.g. as a row's
    /// `retry_at`. May jump when the system clock is adjusted; nothing in
    /// the engine orders on it across workers.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Parks the tick loop for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System clock backed by tokio's async sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
