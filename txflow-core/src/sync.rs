//! Synchronization callbacks fired around transaction boundaries.

use serde::{Deserialize, Serialize};

use crate::error::TxResult;

/// Ordering key for synchronizations that do not care about their position.
///
/// Lower values run first; entries sharing a key keep registration order.
pub const LOWEST_PRECEDENCE: i32 = i32::MAX;

/// Outcome reported to [`TransactionSynchronization::after_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
    /// The outcome could not be determined, for example after a system
    /// failure or when completion is controlled outside the coordinator.
    Unknown,
}

/// Lifecycle callbacks attached to a transactional scope.
///
/// Callbacks are registered on the flow while synchronization is active and
/// invoked in ascending [`order`](Self::order) over a snapshot, so a callback
/// may register further synchronizations without invalidating the iteration.
///
/// Failure policy: errors from [`before_commit`](Self::before_commit) and
/// [`before_completion`](Self::before_completion) propagate to the caller and
/// cause a rollback; errors from [`after_commit`](Self::after_commit)
/// propagate but the commit stands; errors from
/// [`after_completion`](Self::after_completion) are logged and swallowed by
/// whoever triggers them.
pub trait TransactionSynchronization: Send + Sync {
    /// Ordering key used when triggering callbacks.
    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }

    /// The enclosing scope is being suspended.
    fn suspend(&self) {}

    /// The enclosing scope is being resumed.
    fn resume(&self) {}

    /// Flush pending state to the underlying resource, if any.
    fn flush(&self) -> TxResult<()> {
        Ok(())
    }

    /// Called before the physical commit, while the transaction can still be
    /// rolled back. `read_only` reflects the scope's read-only hint.
    fn before_commit(&self, read_only: bool) -> TxResult<()> {
        let _ = read_only;
        Ok(())
    }

    /// Called before completion, on both the commit and rollback paths.
    fn before_completion(&self) -> TxResult<()> {
        Ok(())
    }

    /// Called after a successful physical commit.
    fn after_commit(&self) -> TxResult<()> {
        Ok(())
    }

    /// Called exactly once per scope with the completion outcome.
    fn after_completion(&self, status: CompletionStatus) -> TxResult<()> {
        let _ = status;
        Ok(())
    }
}
