//! Error types for transaction coordination.
//!
//! This module defines the error taxonomy shared by the coordinator, resource
//! managers, and synchronization callbacks. All errors implement
//! [`std::error::Error`] and provide descriptive messages.

use std::error::Error as StdError;

use thiserror::Error;

/// Errors that can occur while coordinating a transaction.
///
/// This enum covers every failure mode surfaced by the framework: lifecycle
/// misuse, unsupported capabilities, rollback surprises at commit time, and
/// failures raised by the underlying resource manager.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A lifecycle call was made in the wrong state, for example completing a
    /// scope twice, requesting `Mandatory` with no enclosing transaction, or
    /// requesting `Never` inside one.
    #[error("illegal transaction state: {0}")]
    IllegalState(String),

    /// The requested timeout is below the `-1` sentinel.
    #[error("invalid transaction timeout: {0}")]
    InvalidTimeout(i32),

    /// A nested scope was requested but is not available, either because the
    /// coordinator disallows nesting or because the transaction object has no
    /// savepoint support.
    #[error("nested transaction not supported: {0}")]
    NestedNotSupported(String),

    /// The resource manager cannot detach its transaction from the flow.
    #[error("transaction suspension not supported: {0}")]
    SuspensionNotSupported(String),

    /// A commit was requested but the transaction was (or had to be) rolled
    /// back instead.
    #[error("unexpected rollback: {0}")]
    UnexpectedRollback(String),

    /// The underlying resource failed during begin, commit, or rollback.
    #[error("transaction system failure during {operation}: {source}")]
    System {
        /// The operation that was being driven when the resource failed.
        operation: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A resource manager reported a failure without a structured cause.
    #[error("resource manager error: {0}")]
    Resource(String),

    /// A resource holder's deadline has passed.
    #[error("transaction timed out: deadline exceeded by {overdue_millis} ms")]
    TimedOut {
        /// How far past the deadline the holder was queried.
        overdue_millis: u64,
    },
}

impl TransactionError {
    /// Wrap a resource failure, recording which operation was in flight.
    pub fn system(
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::System { operation, source: source.into() }
    }

    /// Returns `true` if this is a lifecycle-misuse error.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }

    /// Returns `true` if a commit was answered with a rollback.
    #[must_use]
    pub const fn is_unexpected_rollback(&self) -> bool {
        matches!(self, Self::UnexpectedRollback(_))
    }

    /// Returns `true` if a resource holder ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns `true` if the failure originated in the resource layer.
    #[must_use]
    pub const fn is_resource_failure(&self) -> bool {
        matches!(self, Self::System { .. } | Self::Resource(_))
    }
}

/// Result type alias for transaction operations.
pub type TxResult<T> = Result<T, TransactionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_wraps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = TransactionError::system("commit", io);
        assert!(err.is_resource_failure());
        assert!(err.to_string().contains("commit"));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_classification_helpers() {
        assert!(TransactionError::IllegalState("x".into()).is_illegal_state());
        assert!(TransactionError::UnexpectedRollback("x".into()).is_unexpected_rollback());
        assert!(TransactionError::TimedOut { overdue_millis: 5 }.is_timeout());
        assert!(!TransactionError::InvalidTimeout(-2).is_timeout());
    }
}
