//! The per-invocation transaction status handle.

use std::fmt;
use std::sync::Arc;

use txflow_core::{
    Isolation, Savepoint, SavepointManager, TransactionError, TransactionSynchronization,
    TxResult,
};

use crate::flow::FlowContext;
use crate::manager::{SuspendedResources, TransactionObject};
use crate::sync_support;

/// State detached from a flow while another scope runs in its place.
///
/// Owned by the [`TransactionStatus`] whose creation caused the suspension
/// and drained exactly once when that scope exits.
pub struct SuspendedScope {
    pub(crate) resources: Option<SuspendedResources>,
    pub(crate) synchronizations: Option<Vec<Arc<dyn TransactionSynchronization>>>,
    pub(crate) name: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) isolation: Option<Isolation>,
    pub(crate) was_active: bool,
}

impl SuspendedScope {
    /// A suspension that detached resources but no synchronization state.
    pub(crate) fn resources_only(resources: SuspendedResources) -> Self {
        Self {
            resources: Some(resources),
            synchronizations: None,
            name: None,
            read_only: false,
            isolation: None,
            was_active: false,
        }
    }
}

impl fmt::Debug for SuspendedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedScope")
            .field("resources", &self.resources.as_ref().map(|_| "<opaque>"))
            .field(
                "synchronizations",
                &self.synchronizations.as_ref().map(|v| v.len()),
            )
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("was_active", &self.was_active)
            .finish()
    }
}

/// Handle representing one coordinator scope.
///
/// Returned by `get_transaction` and passed back for `commit` or `rollback`.
/// The handle records whether this scope owns the physical transaction
/// (`is_new_transaction`), whether it activated synchronization, the local
/// rollback-only marker, the held savepoint of a nested scope, and any
/// suspended outer scope to restore on exit.
///
/// A status transitions to completed exactly once; committing or rolling
/// back a completed status fails with `IllegalState`.
pub struct TransactionStatus<T> {
    pub(crate) transaction: Option<T>,
    new_transaction: bool,
    new_synchronization: bool,
    read_only: bool,
    rollback_only: bool,
    completed: bool,
    savepoint: Option<Savepoint>,
    pub(crate) suspended: Option<SuspendedScope>,
}

impl<T: fmt::Debug> fmt::Debug for TransactionStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("transaction", &self.transaction)
            .field("new_transaction", &self.new_transaction)
            .field("new_synchronization", &self.new_synchronization)
            .field("read_only", &self.read_only)
            .field("rollback_only", &self.rollback_only)
            .field("completed", &self.completed)
            .field("savepoint", &self.savepoint)
            .field("suspended", &self.suspended)
            .finish()
    }
}

impl<T: TransactionObject> TransactionStatus<T> {
    pub(crate) fn new(
        transaction: Option<T>,
        new_transaction: bool,
        new_synchronization: bool,
        read_only: bool,
        suspended: Option<SuspendedScope>,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            new_synchronization,
            read_only,
            rollback_only: false,
            completed: false,
            savepoint: None,
            suspended,
        }
    }

    /// Whether this scope carries a transaction object at all, as opposed to
    /// an empty scope.
    #[must_use]
    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Whether this scope owns the physical transaction and is responsible
    /// for committing or rolling it back.
    #[must_use]
    pub fn is_new_transaction(&self) -> bool {
        self.has_transaction() && self.new_transaction
    }

    /// Whether this scope activated synchronization on the flow.
    #[must_use]
    pub fn is_new_synchronization(&self) -> bool {
        self.new_synchronization
    }

    /// The scope's read-only hint.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Mark this scope rollback-only: the only possible outcome is a
    /// rollback.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// The local rollback-only marker, set through this status only.
    #[must_use]
    pub fn is_local_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// The global rollback-only marker of the underlying transaction, which
    /// any participant may have set.
    #[must_use]
    pub fn is_global_rollback_only(&self) -> bool {
        self.transaction.as_ref().is_some_and(TransactionObject::is_rollback_only)
    }

    /// Whether this scope can no longer commit, locally or globally.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.is_local_rollback_only() || self.is_global_rollback_only()
    }

    /// Whether the scope has been committed or rolled back.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn set_completed(&mut self) {
        self.completed = true;
    }

    /// The transaction object, if this scope carries one.
    #[must_use]
    pub fn transaction(&self) -> Option<&T> {
        self.transaction.as_ref()
    }

    /// Mutable access to the transaction object.
    #[must_use]
    pub fn transaction_mut(&mut self) -> Option<&mut T> {
        self.transaction.as_mut()
    }

    /// Flush registered synchronizations and the underlying transaction.
    ///
    /// # Errors
    ///
    /// Propagates the first failing `flush` callback.
    pub fn flush(&mut self, flow: &FlowContext) -> TxResult<()> {
        if self.new_synchronization {
            sync_support::trigger_flush(flow)?;
        }
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.flush();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    /// Whether this scope holds a savepoint (a nested scope).
    #[must_use]
    pub fn has_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    fn savepoints(&mut self) -> TxResult<&mut dyn SavepointManager> {
        self.transaction
            .as_mut()
            .and_then(TransactionObject::savepoint_manager)
            .ok_or_else(|| {
                TransactionError::NestedNotSupported(
                    "transaction object does not support savepoints".to_owned(),
                )
            })
    }

    /// Create a savepoint in the underlying transaction.
    ///
    /// # Errors
    ///
    /// Fails with `NestedNotSupported` if the transaction object offers no
    /// savepoint capability.
    pub fn create_savepoint(&mut self) -> TxResult<Savepoint> {
        self.savepoints()?.create_savepoint()
    }

    /// Roll the underlying transaction back to the given savepoint.
    pub fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()> {
        self.savepoints()?.rollback_to_savepoint(savepoint)
    }

    /// Release the given savepoint.
    pub fn release_savepoint(&mut self, savepoint: Savepoint) -> TxResult<()> {
        self.savepoints()?.release_savepoint(savepoint)
    }

    /// Create a savepoint and hold it for this scope.
    pub(crate) fn create_and_hold_savepoint(&mut self) -> TxResult<()> {
        let savepoint = self.savepoints()?.create_savepoint()?;
        self.savepoint = Some(savepoint);
        Ok(())
    }

    /// Roll back to the held savepoint, release it, and clear it.
    pub(crate) fn rollback_to_held_savepoint(&mut self) -> TxResult<()> {
        let savepoint = self.savepoint.take().ok_or_else(|| {
            TransactionError::IllegalState(
                "cannot roll back to savepoint: none held by this scope".to_owned(),
            )
        })?;
        let manager = self.savepoints()?;
        manager.rollback_to_savepoint(&savepoint)?;
        manager.release_savepoint(savepoint)
    }

    /// Release the held savepoint and clear it.
    pub(crate) fn release_held_savepoint(&mut self) -> TxResult<()> {
        let savepoint = self.savepoint.take().ok_or_else(|| {
            TransactionError::IllegalState(
                "cannot release savepoint: none held by this scope".to_owned(),
            )
        })?;
        self.savepoints()?.release_savepoint(savepoint)
    }
}
