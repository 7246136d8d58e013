//! The resource-manager template: the pluggable seam between the
//! coordinator and an actual transactional resource.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use txflow_core::{
    CompletionStatus, SavepointManager, TransactionDefinition, TransactionError,
    TransactionSynchronization, TxResult,
};

use crate::flow::FlowContext;
use crate::sync_support::invoke_after_completion;

/// Opaque bundle of detached resources produced by [`ResourceManager::suspend`].
///
/// The coordinator stashes it unexamined and hands it back to
/// [`ResourceManager::resume`].
pub type SuspendedResources = Box<dyn Any + Send>;

/// Capabilities of a resource manager's transaction object.
///
/// The coordinator treats the transaction object as opaque apart from these
/// hooks: the global rollback-only marker that any participant can observe,
/// the optional savepoint capability that nested scopes are built on, and a
/// flush signal.
pub trait TransactionObject: Send {
    /// Whether the underlying transaction carries a global rollback-only
    /// marker.
    fn is_rollback_only(&self) -> bool {
        false
    }

    /// The savepoint capability of the underlying transaction, if any.
    ///
    /// Returning `None` makes nested scopes fail with `NestedNotSupported`.
    fn savepoint_manager(&mut self) -> Option<&mut dyn SavepointManager> {
        None
    }

    /// Flush intermediate state to the underlying resource.
    fn flush(&mut self) {}
}

/// Hooks a resource manager provides for the coordinator to drive.
///
/// Four operations are mandatory: producing a transaction object for the
/// current flow state, beginning a new physical transaction, committing, and
/// rolling back. Everything else has a default: existing-transaction
/// detection reports `false`, suspension is unsupported, participation
/// (set-rollback-only) is unsupported, nested scopes use savepoints, and
/// `after_completion` handoff to an externally controlled transaction
/// degrades to an immediate invocation with [`CompletionStatus::Unknown`].
///
/// Implementations never need to apply propagation behavior themselves:
/// the coordinator has already decided whether to begin, join, suspend, or
/// nest by the time a hook runs.
pub trait ResourceManager: Send + Sync {
    /// Transaction object passed back into every other hook.
    type Transaction: TransactionObject;

    /// Return a transaction object reflecting the current flow state.
    ///
    /// If a transaction is already running on the flow (usually detectable
    /// through a resource bound in the [`FlowContext`]), the returned object
    /// must make [`is_existing`](Self::is_existing) report `true`.
    fn current_transaction(&self, flow: &FlowContext) -> TxResult<Self::Transaction>;

    /// Whether the object represents an already-started transaction.
    fn is_existing(&self, transaction: &Self::Transaction) -> bool {
        let _ = transaction;
        false
    }

    /// Begin a new physical transaction with the given definition.
    ///
    /// Any previously running transaction has either been suspended or, for
    /// a nested begin, is expected to be stacked by the manager itself.
    fn begin(
        &self,
        flow: &FlowContext,
        transaction: &mut Self::Transaction,
        definition: &TransactionDefinition,
    ) -> TxResult<()>;

    /// Whether nested scopes use savepoints (`true`, the default) or a
    /// nested [`begin`](Self::begin) on the same transaction object.
    fn use_savepoint_for_nested(&self) -> bool {
        true
    }

    /// Detach the transaction's resources from the flow.
    ///
    /// The returned bundle is kept unexamined and handed back to
    /// [`resume`](Self::resume).
    fn suspend(
        &self,
        flow: &FlowContext,
        transaction: &mut Self::Transaction,
    ) -> TxResult<SuspendedResources> {
        let _ = (flow, transaction);
        Err(TransactionError::SuspensionNotSupported(
            "resource manager does not support transaction suspension".to_owned(),
        ))
    }

    /// Re-attach resources previously returned by [`suspend`](Self::suspend).
    ///
    /// `transaction` is the object of the scope being resumed into, when one
    /// exists; managers that key everything off the flow may ignore it.
    fn resume(
        &self,
        flow: &FlowContext,
        transaction: Option<&mut Self::Transaction>,
        resources: SuspendedResources,
    ) -> TxResult<()> {
        let _ = (flow, transaction, resources);
        Err(TransactionError::SuspensionNotSupported(
            "resource manager does not support transaction suspension".to_owned(),
        ))
    }

    /// Whether a transaction globally marked rollback-only should still be
    /// handed to [`commit`](Self::commit), for managers that detect the
    /// marker themselves.
    fn should_commit_on_global_rollback_only(&self) -> bool {
        false
    }

    /// Preparation before the `before_commit` callbacks run. Failures
    /// propagate to the commit caller and cause a rollback.
    fn prepare_for_commit(
        &self,
        flow: &FlowContext,
        transaction: &mut Self::Transaction,
    ) -> TxResult<()> {
        let _ = (flow, transaction);
        Ok(())
    }

    /// Perform the actual commit. The rollback-only and new-transaction
    /// checks have already been applied.
    fn commit(&self, flow: &FlowContext, transaction: &mut Self::Transaction) -> TxResult<()>;

    /// Perform the actual rollback.
    fn rollback(&self, flow: &FlowContext, transaction: &mut Self::Transaction) -> TxResult<()>;

    /// Mark the existing transaction rollback-only on behalf of a failed
    /// participant.
    fn set_rollback_only(
        &self,
        flow: &FlowContext,
        transaction: &mut Self::Transaction,
    ) -> TxResult<()> {
        let _ = (flow, transaction);
        Err(TransactionError::IllegalState(
            "participating in existing transactions is not supported: \
             no set-rollback-only behavior provided"
                .to_owned(),
        ))
    }

    /// Hand `after_completion` callbacks to a transaction whose completion
    /// is controlled elsewhere.
    ///
    /// The default cannot determine the eventual outcome and invokes the
    /// callbacks immediately with [`CompletionStatus::Unknown`].
    fn register_after_completion_with_existing(
        &self,
        flow: &FlowContext,
        transaction: &Self::Transaction,
        synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
    ) {
        let _ = (flow, transaction);
        debug!(
            "cannot register after-completion callbacks with an externally controlled \
             transaction; invoking immediately with unknown outcome"
        );
        invoke_after_completion(&synchronizations, CompletionStatus::Unknown);
    }

    /// Release resources after completion. Runs on every outcome, after the
    /// physical commit or rollback.
    fn cleanup_after_completion(&self, flow: &FlowContext, transaction: &mut Self::Transaction) {
        let _ = (flow, transaction);
    }
}
