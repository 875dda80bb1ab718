//! Error types for the resilience engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for calls executed under a circuit breaker.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error type returned by the gate, the call executor and the registry.
///
/// Callers always receive either a successful result, a fallback substitute,
/// or one of these typed variants. The wrapped operation error `E` surfaces
/// through [`BreakerError::Operation`] or [`BreakerError::RetriesExhausted`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open and the wait duration has not elapsed.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The bulkhead's concurrency ceiling was reached within the wait budget.
    #[error("bulkhead rejected call under circuit breaker '{0}'")]
    BulkheadRejected(String),

    /// The wrapped operation exceeded its allotted duration.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The retry budget is spent; carries the last operation error.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Total attempts made, including the first call.
        attempts: u32,
        /// The operation error from the final attempt.
        #[source]
        source: E,
    },

    /// The underlying operation failed and no retry applied.
    #[error("operation failed")]
    Operation(#[source] E),

    /// No breaker is registered under the given name.
    #[error("no circuit breaker named '{0}'")]
    BreakerNotFound(String),

    /// The supplied configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration validation errors, raised at breaker-creation time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A rate threshold must lie in the interval (0, 100].
    #[error("{field} must be within (0, 100], got {value}")]
    ThresholdOutOfRange {
        /// Name of the offending configuration field.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A size or count field must be non-zero.
    #[error("{0} must be non-zero")]
    ZeroSize(&'static str),

    /// A breaker with this name is already registered.
    #[error("a circuit breaker named '{0}' is already registered")]
    DuplicateName(String),
}

/// Classification of a failed call outcome, recorded into the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The call exceeded its timeout budget.
    Timeout,

    /// The caller dropped the in-flight call after admission.
    Cancelled,

    /// The wrapped operation returned an error.
    Operation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Dummy;

    impl fmt::Display for Dummy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "dummy")
        }
    }

    impl std::error::Error for Dummy {}

    #[test]
    fn open_error_names_the_breaker() {
        let err: BreakerError<Dummy> = BreakerError::CircuitOpen("payments".into());
        assert_eq!(err.to_string(), "circuit breaker 'payments' is open");
    }

    #[test]
    fn retries_exhausted_keeps_source() {
        let err: BreakerError<Dummy> = BreakerError::RetriesExhausted {
            attempts: 3,
            source: Dummy,
        };
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_error_converts() {
        let err: BreakerError<Dummy> = ConfigError::ZeroSize("window size").into();
        assert!(matches!(err, BreakerError::Config(_)));
    }
}
