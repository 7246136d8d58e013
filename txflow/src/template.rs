//! Execute-around convenience: run a closure inside a transactional scope.

use std::error::Error as StdError;

use thiserror::Error;
use tracing::debug;

use txflow_core::{TransactionDefinition, TransactionError};

use crate::coordinator::TransactionCoordinator;
use crate::flow::FlowContext;
use crate::manager::ResourceManager;
use crate::status::TransactionStatus;

/// Failure of an [`execute`](TransactionCoordinator::execute) call.
#[derive(Debug, Error)]
pub enum ExecuteError<E: StdError + 'static> {
    /// The closure failed; the scope was completed according to the
    /// definition's rollback rules.
    #[error("application error: {0}")]
    Application(#[source] E),

    /// The coordinator failed to establish or commit the scope.
    #[error(transparent)]
    Transaction(TransactionError),

    /// The closure failed and completing the scope afterwards failed too.
    #[error("scope completion failed after application error ({completion}): {application}")]
    Completion {
        /// The closure's error.
        application: E,
        /// The completion failure that followed it.
        completion: TransactionError,
    },
}

impl<R: ResourceManager> TransactionCoordinator<R> {
    /// Run `f` inside a scope established per `definition`.
    ///
    /// On `Ok` the scope is committed. On `Err` the definition's rollback
    /// rules decide: rollback when the rule matches the error (the default
    /// rule always matches), otherwise attempt the commit anyway. The
    /// application error is always preserved in the returned
    /// [`ExecuteError`].
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub fn execute<T, E, F>(
        &self,
        flow: &FlowContext,
        definition: &TransactionDefinition,
        f: F,
    ) -> Result<T, ExecuteError<E>>
    where
        E: StdError + 'static,
        F: FnOnce(&mut TransactionStatus<R::Transaction>) -> Result<T, E>,
    {
        let mut status = self
            .get_transaction(flow, Some(definition))
            .map_err(ExecuteError::Transaction)?;

        match f(&mut status) {
            Ok(value) => {
                self.commit(flow, &mut status).map_err(ExecuteError::Transaction)?;
                Ok(value)
            }
            Err(application) => {
                let completion = if definition.rollback_rules.should_rollback(&application) {
                    debug!("rolling back scope for application error");
                    self.rollback(flow, &mut status)
                } else {
                    debug!("rollback rules kept the scope committable despite the error");
                    self.commit(flow, &mut status)
                };
                match completion {
                    Ok(()) => Err(ExecuteError::Application(application)),
                    Err(completion) => Err(ExecuteError::Completion { application, completion }),
                }
            }
        }
    }
}
