//! Worker engine for durable HTTP request delivery.
//!
//! Drains the shared request store with a batched lock-and-process loop.
//! Uses PostgreSQL `FOR UPDATE SKIP LOCKED` so any number of worker
//! processes can run against the same tables without double delivery.
//!
//! # Engine Architecture
//!
//! ```text
//!                  ┌─────────────────────────────────────────┐
//!                  │               PostgreSQL                │
//!                  │  ┌───────────────────────────────────┐  │
//!                  │  │          requests table           │  │
//!                  │  │  ready ─ pending ─ waiting ─ ...  │  │
//!                  │  │     FOR UPDATE SKIP LOCKED        │  │
//!                  │  └───────────────────────────────────┘  │
//!                  └─────────────────────────────────────────┘
//!                        │                          ▲
//!                   claim batch                promote waiting
//!                        │                          │
//!                        ▼                          │
//!              ┌──────────────────┐        ┌────────┴───────┐
//!              │      Worker      │───────▶│    Sweeper     │
//!              │  tick loop, tag  │  1/s   │ (second gate)  │
//!              └──────────────────┘        └────────────────┘
//!                        │
//!                 rows in (priority, id) order
//!                        ▼
//!              ┌──────────────────┐        ┌────────────────┐
//!              │    Processor     │───────▶│   Transport    │
//!              │ classify, log,   │        │ reqwest client │
//!              │ transition,      │        └────────────────┘
//!              │ always unlock    │
//!              └──────────────────┘
//! ```
//!
//! Delivery is at-least-once: idempotency toward the upstream is the
//! caller's concern, via the headers it persists with the request.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod processor;
pub mod retry;
pub mod sweeper;
pub mod transport;
pub mod worker;

pub use config::Config;
pub use error::{DeliveryError, Result};
pub use processor::{plan_transition, Processor, Transition};
pub use retry::BackoffPolicy;
pub use sweeper::SecondGate;
pub use transport::{
    HttpTransport, Outcome, OutcomeKind, Transport, TransportConfig, TransportRequest,
    INCONSISTENT_CODE, TIMED_OUT_CODE,
};
pub use worker::{Worker, WorkerConfig, WorkerStats};

/// Default rows claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default minimum cycle period in microseconds.
pub const DEFAULT_TICK_MICROS: u64 = 100_000;

/// Default HTTP transport timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

/// Default retry cap before a row fails.
pub const DEFAULT_MAX_RETRIES: i32 = 10;
