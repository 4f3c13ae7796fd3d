//! Core domain models and storage repositories.
//!
//! Provides the persisted request model, its state machine, the error
//! taxonomy, and the repository layer over PostgreSQL. The worker engine in
//! `surety-delivery` builds on these foundations and never issues SQL of its
//! own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptTimings, NewRequest, NewRequestLog, RequestId, RequestLog, RequestState, StoredRequest,
};
pub use storage::Storage;
pub use time::{Clock, RealClock};
