//! Trigger helpers for synchronization callbacks.

use std::sync::Arc;

use tracing::error;

use txflow_core::{CompletionStatus, TransactionSynchronization, TxResult};

use crate::flow::FlowContext;

/// Fire `before_commit` across the flow's snapshot; the first failure stops
/// the iteration and propagates.
pub(crate) fn trigger_before_commit(flow: &FlowContext, read_only: bool) -> TxResult<()> {
    for sync in flow.synchronizations()? {
        sync.before_commit(read_only)?;
    }
    Ok(())
}

/// Fire `before_completion` across the flow's snapshot; the first failure
/// stops the iteration and propagates.
pub(crate) fn trigger_before_completion(flow: &FlowContext) -> TxResult<()> {
    for sync in flow.synchronizations()? {
        sync.before_completion()?;
    }
    Ok(())
}

/// Fire `after_commit` across the flow's snapshot; the first failure stops
/// the iteration and propagates, but the commit stands.
pub(crate) fn trigger_after_commit(flow: &FlowContext) -> TxResult<()> {
    for sync in flow.synchronizations()? {
        sync.after_commit()?;
    }
    Ok(())
}

/// Fire `flush` across the flow's snapshot.
pub(crate) fn trigger_flush(flow: &FlowContext) -> TxResult<()> {
    for sync in flow.synchronizations()? {
        sync.flush()?;
    }
    Ok(())
}

/// Invoke `after_completion` on the given callbacks with the final outcome.
///
/// Failures are logged and swallowed: completion has already happened and
/// there is nothing left to undo. Also used by resource managers that defer
/// the callbacks to an externally controlled transaction.
pub fn invoke_after_completion(
    synchronizations: &[Arc<dyn TransactionSynchronization>],
    status: CompletionStatus,
) {
    for sync in synchronizations {
        if let Err(err) = sync.after_completion(status) {
            error!(error = %err, "after-completion callback failed");
        }
    }
}
