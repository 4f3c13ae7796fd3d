//! Once-per-second gate for the waiting sweeper.
//!
//! The sweeper's promotion UPDATE is idempotent, so the gate only bounds how
//! often a worker issues it: at most once per wall-clock second, measured on
//! a monotonic clock. The baseline is taken at construction, so the first
//! call inside the baseline second never fires.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Stateful guard that opens once per elapsed second.
#[derive(Debug)]
pub struct SecondGate {
    baseline: Instant,
    last_second: AtomicU64,
}

impl SecondGate {
    /// Creates a gate with its baseline at `now`.
    pub fn new(now: Instant) -> Self {
        Self { baseline: now, last_second: AtomicU64::new(0) }
    }

    /// Returns true when the whole-second count has advanced since the last
    /// time this gate opened.
    pub fn try_enter(&self, now: Instant) -> bool {
        let second = now.saturating_duration_since(self.baseline).as_secs();
        let mut last = self.last_second.load(Ordering::Acquire);

        loop {
            if second <= last {
                return false;
            }
            match self.last_second.compare_exchange_weak(
                last,
                second,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last = observed,
            }
        }
    }
}
