//! Test harness for surety integration and unit tests.
//!
//! Provides a deterministic clock, schema-isolated test databases, and
//! fixture builders. Database-backed helpers are opt-in: they return `None`
//! when `DATABASE_URL` is unset so suites degrade to their in-memory tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod database;
pub mod fixtures;
pub mod time;

pub use database::TestDatabase;
pub use fixtures::{make_retry_due, RequestBuilder};
pub use time::TestClock;

use tracing_subscriber::EnvFilter;

/// Initializes test-writer tracing once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,surety=debug")),
        )
        .with_test_writer()
        .try_init();
}
