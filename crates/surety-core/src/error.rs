//! Error taxonomy for storage operations.
//!
//! Storage errors distinguish transient database failures (retried by the
//! claim transaction), lost claim races, and invalid state transitions so the
//! worker loop can decide what survives the current tick.

use thiserror::Error;

use crate::models::RequestState;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The claim SELECT found candidates but the UPDATE locked none of them.
    #[error("claim failed: selected {selected} ready rows but locked none")]
    ClaimFailed {
        /// Number of rows the claim SELECT returned.
        selected: usize,
    },

    /// A transition the state machine forbids, e.g. abandoning a terminal row.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the row is currently in.
        from: RequestState,
        /// State the caller asked for.
        to: RequestState,
    },

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Whether a database error is worth retrying inside the claim transaction.
///
/// Covers Postgres deadlock detection (40P01) and serialization failures
/// (40001), plus dropped connections that the pool will re-establish.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001" | "40P01"))
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
