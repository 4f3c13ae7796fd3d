//! Error types for the worker engine.
//!
//! The loop never dies from a per-row failure: storage errors abort one
//! cycle, processor faults pause one row. The only fatal conditions are
//! impossible configurations, detected at construction.

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error surface of the worker engine.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Storage operation failed; includes lost claim races.
    #[error(transparent)]
    Storage(#[from] surety_core::CoreError),

    /// Impossible configuration detected at construction.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What was wrong.
        message: String,
    },
}

impl DeliveryError {
    /// Whether this error is a lost claim race rather than a real fault.
    pub fn is_claim_failure(&self) -> bool {
        matches!(self, Self::Storage(surety_core::CoreError::ClaimFailed { .. }))
    }
}

#[cfg(test)]
mod tests {
    use surety_core::CoreError;

    use super::*;

    #[test]
    fn claim_failures_are_recognized() {
        let err: DeliveryError = CoreError::ClaimFailed { selected: 3 }.into();
        assert!(err.is_claim_failure());

        let err: DeliveryError = CoreError::Database("gone".to_string()).into();
        assert!(!err.is_claim_failure());
    }
}
