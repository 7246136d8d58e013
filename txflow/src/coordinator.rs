//! The transaction coordinator: propagation behavior, suspension, and the
//! commit/rollback workflows.
//!
//! [`TransactionCoordinator`] implements the standard transaction workflow
//! over a pluggable [`ResourceManager`]:
//!
//! - determine whether a transaction already runs on the flow;
//! - apply the requested propagation behavior, suspending and resuming
//!   scopes as necessary;
//! - check the rollback-only markers on commit;
//! - apply the appropriate action on rollback (physical rollback, savepoint
//!   rollback, or marking the shared transaction rollback-only);
//! - trigger registered synchronization callbacks at each boundary.
//!
//! The coordinator is strictly synchronous: every call runs to completion on
//! the invoking flow, and all callbacks run on that same flow.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use txflow_core::{
    CompletionStatus, Isolation, Propagation, TransactionDefinition, TransactionError,
    TransactionSynchronization, TxResult, TIMEOUT_DEFAULT,
};

use crate::flow::FlowContext;
use crate::manager::ResourceManager;
use crate::status::{SuspendedScope, TransactionStatus};
use crate::sync_support;

/// When flow synchronization is activated for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Activate synchronization for every scope, even empty ones created by
    /// `Supports`/`NotSupported`/`Never` without a backing transaction.
    #[default]
    Always,
    /// Activate synchronization only for scopes with an actual transaction.
    OnActualTransaction,
    /// Never activate synchronization.
    Never,
}

/// Construction-time options for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// When to activate flow synchronization for a scope.
    pub sync_mode: SyncMode,

    /// Timeout applied when a definition asks for [`TIMEOUT_DEFAULT`].
    pub default_timeout_seconds: i32,

    /// Whether `Nested` propagation is accepted.
    pub nested_allowed: bool,

    /// Whether joining an existing transaction validates isolation and
    /// read-only compatibility.
    pub validate_existing: bool,

    /// Whether a failed participant marks the whole transaction
    /// rollback-only.
    pub global_rollback_on_participation_failure: bool,

    /// Whether inner scopes surface `UnexpectedRollback` for a global
    /// rollback-only marker, instead of only the outermost scope.
    pub fail_early_on_global_rollback_only: bool,

    /// Whether a failing physical commit is answered with a compensating
    /// rollback.
    pub rollback_on_commit_failure: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Always,
            default_timeout_seconds: TIMEOUT_DEFAULT,
            nested_allowed: false,
            validate_existing: false,
            global_rollback_on_participation_failure: true,
            fail_early_on_global_rollback_only: false,
            rollback_on_commit_failure: false,
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the synchronization mode.
    #[must_use]
    pub const fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set the default timeout in seconds.
    #[must_use]
    pub const fn with_default_timeout(mut self, seconds: i32) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    /// Allow `Nested` propagation.
    #[must_use]
    pub const fn nested_allowed(mut self, allowed: bool) -> Self {
        self.nested_allowed = allowed;
        self
    }

    /// Validate isolation/read-only compatibility when joining.
    #[must_use]
    pub const fn validate_existing(mut self, validate: bool) -> Self {
        self.validate_existing = validate;
        self
    }

    /// Control whether a failed participant poisons the whole transaction.
    #[must_use]
    pub const fn global_rollback_on_participation_failure(mut self, global: bool) -> Self {
        self.global_rollback_on_participation_failure = global;
        self
    }

    /// Surface `UnexpectedRollback` from inner scopes.
    #[must_use]
    pub const fn fail_early_on_global_rollback_only(mut self, fail_early: bool) -> Self {
        self.fail_early_on_global_rollback_only = fail_early;
        self
    }

    /// Drive a compensating rollback when the physical commit fails.
    #[must_use]
    pub const fn rollback_on_commit_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_commit_failure = rollback;
        self
    }
}

/// Coordinates transactional scopes over a pluggable resource manager.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use txflow::managers::{MemoryResourceManager, MemoryStore};
/// use txflow::{FlowContext, TransactionCoordinator, TransactionDefinition};
///
/// let store = Arc::new(MemoryStore::new());
/// let coordinator = TransactionCoordinator::new(MemoryResourceManager::new(Arc::clone(&store)));
/// let flow = FlowContext::new();
///
/// let mut status = coordinator
///     .get_transaction(&flow, Some(&TransactionDefinition::new()))
///     .expect("failed to begin");
/// status
///     .transaction()
///     .expect("scope carries a transaction")
///     .put("greeting", b"hello")
///     .expect("failed to buffer write");
/// coordinator.commit(&flow, &mut status).expect("failed to commit");
///
/// assert_eq!(store.get("greeting"), Some(b"hello".to_vec()));
/// ```
pub struct TransactionCoordinator<R: ResourceManager> {
    manager: R,
    config: CoordinatorConfig,
}

impl<R: ResourceManager> TransactionCoordinator<R> {
    /// Create a coordinator with default configuration.
    pub fn new(manager: R) -> Self {
        Self { manager, config: CoordinatorConfig::default() }
    }

    /// Create a coordinator with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidTimeout` if `default_timeout_seconds` is below the
    /// [`TIMEOUT_DEFAULT`] sentinel.
    pub fn with_config(manager: R, config: CoordinatorConfig) -> TxResult<Self> {
        if config.default_timeout_seconds < TIMEOUT_DEFAULT {
            return Err(TransactionError::InvalidTimeout(config.default_timeout_seconds));
        }
        Ok(Self { manager, config })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The resource manager being driven.
    #[must_use]
    pub fn manager(&self) -> &R {
        &self.manager
    }

    // ------------------------------------------------------------------
    // Scope entry
    // ------------------------------------------------------------------

    /// Establish a transactional scope according to `definition`.
    ///
    /// With no definition, defaults apply: `Required` propagation, default
    /// isolation, manager timeout, writable.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` for `Mandatory` without an existing
    /// transaction or `Never` with one, `InvalidTimeout` for a timeout below
    /// the sentinel, `NestedNotSupported` when nesting is disallowed or
    /// unavailable, and propagates resource-manager failures.
    pub fn get_transaction(
        &self,
        flow: &FlowContext,
        definition: Option<&TransactionDefinition>,
    ) -> TxResult<TransactionStatus<R::Transaction>> {
        let default_definition;
        let definition = match definition {
            Some(definition) => definition,
            None => {
                default_definition = TransactionDefinition::default();
                &default_definition
            }
        };

        let mut transaction = self.manager.current_transaction(flow)?;

        if self.manager.is_existing(&transaction) {
            return self.handle_existing(flow, definition, transaction);
        }

        if definition.timeout_seconds < TIMEOUT_DEFAULT {
            return Err(TransactionError::InvalidTimeout(definition.timeout_seconds));
        }

        match definition.propagation {
            Propagation::Mandatory => Err(TransactionError::IllegalState(
                "no existing transaction found for a scope marked as mandatory".to_owned(),
            )),
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested => {
                // No existing transaction, so only synchronization state can
                // need suspending here.
                let suspended = self.suspend(flow, None)?;
                debug!(
                    name = definition.name.as_deref().unwrap_or_default(),
                    "creating new transaction"
                );
                if let Err(err) = self.begin_transaction(flow, definition, &mut transaction) {
                    if let Some(resume_err) =
                        self.resume_after_begin_failure(flow, None, suspended, &err)
                    {
                        return Err(resume_err);
                    }
                    return Err(err);
                }
                let requested_sync = self.config.sync_mode != SyncMode::Never;
                self.prepare_status(
                    flow,
                    definition,
                    Some(transaction),
                    true,
                    requested_sync,
                    suspended,
                )
            }
            Propagation::Supports | Propagation::NotSupported | Propagation::Never => {
                if definition.isolation != Isolation::Default {
                    warn!(
                        isolation = ?definition.isolation,
                        "isolation level specified for a scope without an actual \
                         transaction; it will be ignored"
                    );
                }
                let requested_sync = self.config.sync_mode == SyncMode::Always;
                self.prepare_status(flow, definition, None, true, requested_sync, None)
            }
        }
    }

    /// Establish a scope when a transaction is already running on the flow.
    fn handle_existing(
        &self,
        flow: &FlowContext,
        definition: &TransactionDefinition,
        mut transaction: R::Transaction,
    ) -> TxResult<TransactionStatus<R::Transaction>> {
        match definition.propagation {
            Propagation::Never => Err(TransactionError::IllegalState(
                "existing transaction found for a scope marked as never".to_owned(),
            )),
            Propagation::NotSupported => {
                debug!("suspending current transaction");
                let suspended = self.suspend(flow, Some(&mut transaction))?;
                let requested_sync = self.config.sync_mode == SyncMode::Always;
                self.prepare_status(flow, definition, None, false, requested_sync, suspended)
            }
            Propagation::RequiresNew => {
                debug!(
                    name = definition.name.as_deref().unwrap_or_default(),
                    "suspending current transaction, creating new transaction"
                );
                let suspended = self.suspend(flow, Some(&mut transaction))?;
                if let Err(err) = self.begin_transaction(flow, definition, &mut transaction) {
                    if let Some(resume_err) = self.resume_after_begin_failure(
                        flow,
                        Some(&mut transaction),
                        suspended,
                        &err,
                    ) {
                        return Err(resume_err);
                    }
                    return Err(err);
                }
                let requested_sync = self.config.sync_mode != SyncMode::Never;
                self.prepare_status(
                    flow,
                    definition,
                    Some(transaction),
                    true,
                    requested_sync,
                    suspended,
                )
            }
            Propagation::Nested => {
                if !self.config.nested_allowed {
                    return Err(TransactionError::NestedNotSupported(
                        "nested scopes are disabled for this coordinator; \
                         enable `nested_allowed` to use them"
                            .to_owned(),
                    ));
                }
                debug!(
                    name = definition.name.as_deref().unwrap_or_default(),
                    "creating nested transaction"
                );
                if self.manager.use_savepoint_for_nested() {
                    // A savepoint scope neither owns the physical transaction
                    // nor activates synchronization of its own.
                    let mut status =
                        self.prepare_status(flow, definition, Some(transaction), false, false, None)?;
                    status.create_and_hold_savepoint()?;
                    Ok(status)
                } else {
                    // Nested begin on the same transaction object; the
                    // manager stacks it itself.
                    self.begin_transaction(flow, definition, &mut transaction)?;
                    let requested_sync = self.config.sync_mode != SyncMode::Never;
                    self.prepare_status(
                        flow,
                        definition,
                        Some(transaction),
                        true,
                        requested_sync,
                        None,
                    )
                }
            }
            Propagation::Required | Propagation::Supports | Propagation::Mandatory => {
                debug!("participating in existing transaction");
                if self.config.validate_existing {
                    if definition.isolation != Isolation::Default {
                        let current = flow.current_transaction_isolation();
                        if current != Some(definition.isolation) {
                            return Err(TransactionError::IllegalState(format!(
                                "participating scope specifies isolation {:?}, incompatible \
                                 with the existing transaction ({current:?})",
                                definition.isolation,
                            )));
                        }
                    }
                    if !definition.read_only && flow.is_current_transaction_read_only() {
                        return Err(TransactionError::IllegalState(
                            "participating scope is not marked read-only but the existing \
                             transaction is"
                                .to_owned(),
                        ));
                    }
                }
                let requested_sync = self.config.sync_mode != SyncMode::Never;
                self.prepare_status(flow, definition, Some(transaction), false, requested_sync, None)
            }
        }
    }

    /// Begin a physical transaction, substituting the coordinator default
    /// when the definition leaves the timeout unset.
    fn begin_transaction(
        &self,
        flow: &FlowContext,
        definition: &TransactionDefinition,
        transaction: &mut R::Transaction,
    ) -> TxResult<()> {
        if definition.timeout_seconds == TIMEOUT_DEFAULT
            && self.config.default_timeout_seconds != TIMEOUT_DEFAULT
        {
            let mut resolved = definition.clone();
            resolved.timeout_seconds = self.config.default_timeout_seconds;
            self.manager.begin(flow, transaction, &resolved)
        } else {
            self.manager.begin(flow, transaction, definition)
        }
    }

    /// Build a status and activate synchronization for it when appropriate.
    fn prepare_status(
        &self,
        flow: &FlowContext,
        definition: &TransactionDefinition,
        transaction: Option<R::Transaction>,
        new_transaction: bool,
        requested_sync: bool,
        suspended: Option<SuspendedScope>,
    ) -> TxResult<TransactionStatus<R::Transaction>> {
        let new_synchronization = requested_sync && !flow.is_synchronization_active();
        let status = TransactionStatus::new(
            transaction,
            new_transaction,
            new_synchronization,
            definition.read_only,
            suspended,
        );
        if status.is_new_synchronization() {
            flow.set_actual_transaction_active(status.has_transaction());
            flow.set_current_transaction_isolation(
                (definition.isolation != Isolation::Default).then_some(definition.isolation),
            );
            flow.set_current_transaction_read_only(definition.read_only);
            flow.set_current_transaction_name(definition.name.clone());
            flow.init_synchronization()?;
        }
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Suspension and resumption
    // ------------------------------------------------------------------

    /// Suspend the given transaction and any active synchronization.
    ///
    /// With `None`, only synchronization state is suspended, if any.
    fn suspend(
        &self,
        flow: &FlowContext,
        transaction: Option<&mut R::Transaction>,
    ) -> TxResult<Option<SuspendedScope>> {
        if flow.is_synchronization_active() {
            let suspended_syncs = self.suspend_synchronizations(flow)?;
            let resources = match transaction {
                Some(transaction) => match self.manager.suspend(flow, transaction) {
                    Ok(resources) => Some(resources),
                    Err(err) => {
                        // The original transaction is still active; put its
                        // synchronizations back before failing.
                        if let Err(resume_err) =
                            self.resume_synchronizations(flow, suspended_syncs)
                        {
                            error!(
                                error = %resume_err,
                                "failed to reactivate synchronization after suspension failure"
                            );
                        }
                        return Err(err);
                    }
                },
                None => None,
            };
            let name = flow.current_transaction_name();
            flow.set_current_transaction_name(None);
            let read_only = flow.is_current_transaction_read_only();
            flow.set_current_transaction_read_only(false);
            let isolation = flow.current_transaction_isolation();
            flow.set_current_transaction_isolation(None);
            let was_active = flow.is_actual_transaction_active();
            flow.set_actual_transaction_active(false);
            Ok(Some(SuspendedScope {
                resources,
                synchronizations: Some(suspended_syncs),
                name,
                read_only,
                isolation,
                was_active,
            }))
        } else if let Some(transaction) = transaction {
            let resources = self.manager.suspend(flow, transaction)?;
            Ok(Some(SuspendedScope::resources_only(resources)))
        } else {
            Ok(None)
        }
    }

    /// Resume a previously suspended scope.
    fn resume(
        &self,
        flow: &FlowContext,
        transaction: Option<&mut R::Transaction>,
        suspended: Option<SuspendedScope>,
    ) -> TxResult<()> {
        if let Some(scope) = suspended {
            if let Some(resources) = scope.resources {
                self.manager.resume(flow, transaction, resources)?;
            }
            if let Some(synchronizations) = scope.synchronizations {
                flow.set_actual_transaction_active(scope.was_active);
                flow.set_current_transaction_isolation(scope.isolation);
                flow.set_current_transaction_read_only(scope.read_only);
                flow.set_current_transaction_name(scope.name);
                self.resume_synchronizations(flow, synchronizations)?;
            }
        }
        Ok(())
    }

    /// Restore the outer scope after an inner begin failed.
    ///
    /// Returns the resume failure if the restoration itself fails; that
    /// failure overrides the begin error.
    fn resume_after_begin_failure(
        &self,
        flow: &FlowContext,
        transaction: Option<&mut R::Transaction>,
        suspended: Option<SuspendedScope>,
        begin_err: &TransactionError,
    ) -> Option<TransactionError> {
        match self.resume(flow, transaction, suspended) {
            Ok(()) => None,
            Err(resume_err) => {
                error!(
                    error = %begin_err,
                    "inner transaction begin failure overridden by outer resume failure"
                );
                Some(resume_err)
            }
        }
    }

    fn suspend_synchronizations(
        &self,
        flow: &FlowContext,
    ) -> TxResult<Vec<Arc<dyn TransactionSynchronization>>> {
        let synchronizations = flow.synchronizations()?;
        for sync in &synchronizations {
            sync.suspend();
        }
        flow.clear_synchronization()?;
        Ok(synchronizations)
    }

    fn resume_synchronizations(
        &self,
        flow: &FlowContext,
        synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
    ) -> TxResult<()> {
        flow.init_synchronization()?;
        for sync in synchronizations {
            sync.resume();
            flow.register_synchronization(sync)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Commit the given scope.
    ///
    /// A local rollback-only marker turns the commit into a rollback that
    /// returns normally; a global marker does the same but fails with
    /// `UnexpectedRollback` at the transaction owner (or everywhere, with
    /// `fail_early_on_global_rollback_only`).
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if the scope is already completed. Resource
    /// failures during the physical commit are propagated after the
    /// completion callbacks and cleanup have run.
    pub fn commit(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        if status.is_completed() {
            return Err(TransactionError::IllegalState(
                "scope is already completed: do not call commit or rollback more than once"
                    .to_owned(),
            ));
        }

        if status.is_local_rollback_only() {
            debug!("transactional code has requested rollback");
            return self.process_rollback(flow, status);
        }

        if !self.manager.should_commit_on_global_rollback_only() && status.is_global_rollback_only()
        {
            debug!("transaction is globally marked rollback-only but commit was requested");
            self.process_rollback(flow, status)?;
            // Surface the unexpected rollback only at the transaction owner,
            // unless configured to fail early everywhere.
            if status.is_new_transaction() || self.config.fail_early_on_global_rollback_only {
                return Err(TransactionError::UnexpectedRollback(
                    "transaction rolled back because it has been marked as rollback-only"
                        .to_owned(),
                ));
            }
            return Ok(());
        }

        self.process_commit(flow, status)
    }

    fn process_commit(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        let result = self.commit_body(flow, status);
        let cleanup = self.cleanup_after_completion(flow, status);
        result.and(cleanup)
    }

    fn commit_body(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        let mut before_completion_invoked = false;

        // Preparation and pre-commit callbacks. A failure anywhere here
        // means the transaction must be rolled back.
        let global_rollback_only =
            match self.run_pre_commit_steps(flow, status, &mut before_completion_invoked) {
                Ok(flag) => flag,
                Err(err) => {
                    if !before_completion_invoked {
                        if let Err(trigger_err) = self.trigger_before_completion(flow, status) {
                            error!(
                                error = %trigger_err,
                                "before-completion callback failed during commit failure handling"
                            );
                        }
                    }
                    return Err(self.rollback_after_commit_failure(flow, status, err));
                }
            };

        // Savepoint release for nested scopes, physical commit for
        // transaction owners, nothing for mere participants.
        let physical: TxResult<()> = if status.has_savepoint() {
            debug!("releasing transaction savepoint");
            status.release_held_savepoint()
        } else if status.is_new_transaction() {
            debug!("initiating transaction commit");
            match status.transaction.as_mut() {
                Some(transaction) => self.manager.commit(flow, transaction),
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        if let Err(err) = physical {
            return Err(self.handle_physical_commit_failure(flow, status, err));
        }

        // The global marker was set but the physical commit went through
        // anyway; report the silent rollback.
        if global_rollback_only {
            let err = TransactionError::UnexpectedRollback(
                "transaction silently rolled back because it has been marked as rollback-only"
                    .to_owned(),
            );
            self.trigger_after_completion(flow, status, CompletionStatus::RolledBack);
            return Err(err);
        }

        // After-commit failures reach the caller, but the transaction is
        // committed and completion still runs.
        let after_commit = self.trigger_after_commit(flow, status);
        self.trigger_after_completion(flow, status, CompletionStatus::Committed);
        after_commit
    }

    fn run_pre_commit_steps(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
        before_completion_invoked: &mut bool,
    ) -> TxResult<bool> {
        if let Some(transaction) = status.transaction.as_mut() {
            self.manager.prepare_for_commit(flow, transaction)?;
        }
        self.trigger_before_commit(flow, status)?;
        self.trigger_before_completion(flow, status)?;
        *before_completion_invoked = true;

        // Snapshot the global marker before the physical commit; only the
        // transaction owner (or a fail-early coordinator) acts on it.
        let mut global_rollback_only = false;
        if status.is_new_transaction() || self.config.fail_early_on_global_rollback_only {
            global_rollback_only = status.is_global_rollback_only();
        }
        Ok(global_rollback_only)
    }

    /// Classify a failure of the savepoint release or physical commit.
    fn handle_physical_commit_failure(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
        err: TransactionError,
    ) -> TransactionError {
        if err.is_unexpected_rollback() {
            // The resource manager detected a rollback while committing.
            self.trigger_after_completion(flow, status, CompletionStatus::RolledBack);
            err
        } else if self.config.rollback_on_commit_failure {
            self.rollback_after_commit_failure(flow, status, err)
        } else {
            self.trigger_after_completion(flow, status, CompletionStatus::Unknown);
            err
        }
    }

    /// Drive a compensating rollback after a commit-path failure.
    ///
    /// Returns the error to surface: the original failure, or the rollback
    /// failure when the compensation itself fails.
    fn rollback_after_commit_failure(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
        original: TransactionError,
    ) -> TransactionError {
        let compensation: TxResult<()> = (|| {
            if status.is_new_transaction() {
                debug!("initiating transaction rollback after commit failure");
                if let Some(transaction) = status.transaction.as_mut() {
                    self.manager.rollback(flow, transaction)?;
                }
            } else if status.has_transaction()
                && self.config.global_rollback_on_participation_failure
            {
                debug!("marking existing transaction rollback-only after commit failure");
                if let Some(transaction) = status.transaction.as_mut() {
                    self.manager.set_rollback_only(flow, transaction)?;
                }
            }
            Ok(())
        })();

        match compensation {
            Ok(()) => {
                self.trigger_after_completion(flow, status, CompletionStatus::RolledBack);
                original
            }
            Err(rollback_err) => {
                error!(error = %original, "commit failure overridden by rollback failure");
                self.trigger_after_completion(flow, status, CompletionStatus::Unknown);
                rollback_err
            }
        }
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Roll the given scope back.
    ///
    /// A transaction owner rolls back physically; a nested scope rolls back
    /// to its savepoint; a participant marks the shared transaction
    /// rollback-only (or leaves the decision to the owner, depending on
    /// configuration).
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if the scope is already completed, and
    /// propagates resource failures after completion callbacks and cleanup.
    pub fn rollback(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        if status.is_completed() {
            return Err(TransactionError::IllegalState(
                "scope is already completed: do not call commit or rollback more than once"
                    .to_owned(),
            ));
        }
        self.process_rollback(flow, status)
    }

    fn process_rollback(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        let result = self.rollback_body(flow, status);
        let cleanup = self.cleanup_after_completion(flow, status);
        result.and(cleanup)
    }

    fn rollback_body(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        let body: TxResult<()> = (|| {
            self.trigger_before_completion(flow, status)?;
            if status.has_savepoint() {
                debug!("rolling back transaction to savepoint");
                status.rollback_to_held_savepoint()?;
            } else if status.is_new_transaction() {
                debug!("initiating transaction rollback");
                if let Some(transaction) = status.transaction.as_mut() {
                    self.manager.rollback(flow, transaction)?;
                }
            } else if status.has_transaction() {
                if status.is_local_rollback_only()
                    || self.config.global_rollback_on_participation_failure
                {
                    debug!("participating scope failed: marking transaction rollback-only");
                    if let Some(transaction) = status.transaction.as_mut() {
                        self.manager.set_rollback_only(flow, transaction)?;
                    }
                } else {
                    debug!("participating scope failed: leaving rollback to the owner");
                }
            } else {
                debug!("should roll back transaction but cannot: no transaction available");
            }
            Ok(())
        })();

        match body {
            Ok(()) => {
                self.trigger_after_completion(flow, status, CompletionStatus::RolledBack);
                Ok(())
            }
            Err(err) => {
                self.trigger_after_completion(flow, status, CompletionStatus::Unknown);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Mark the scope completed, clear synchronization it activated, let the
    /// manager release resources, and restore any suspended outer scope.
    /// Runs on every completion path.
    fn cleanup_after_completion(
        &self,
        flow: &FlowContext,
        status: &mut TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        let mut first_err = None;

        status.set_completed();
        if status.is_new_synchronization() {
            if let Err(err) = flow.clear() {
                first_err.get_or_insert(err);
            }
        }
        if status.is_new_transaction() {
            if let Some(transaction) = status.transaction.as_mut() {
                self.manager.cleanup_after_completion(flow, transaction);
            }
        }
        if let Some(suspended) = status.suspended.take() {
            debug!("resuming suspended scope after completion of inner scope");
            let transaction = status.transaction.as_mut();
            if let Err(err) = self.resume(flow, transaction, Some(suspended)) {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn trigger_before_commit(
        &self,
        flow: &FlowContext,
        status: &TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        if status.is_new_synchronization() {
            sync_support::trigger_before_commit(flow, status.is_read_only())?;
        }
        Ok(())
    }

    fn trigger_before_completion(
        &self,
        flow: &FlowContext,
        status: &TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        if status.is_new_synchronization() {
            sync_support::trigger_before_completion(flow)?;
        }
        Ok(())
    }

    fn trigger_after_commit(
        &self,
        flow: &FlowContext,
        status: &TransactionStatus<R::Transaction>,
    ) -> TxResult<()> {
        if status.is_new_synchronization() {
            sync_support::trigger_after_commit(flow)?;
        }
        Ok(())
    }

    fn trigger_after_completion(
        &self,
        flow: &FlowContext,
        status: &TransactionStatus<R::Transaction>,
        completion: CompletionStatus,
    ) {
        if !status.is_new_synchronization() {
            return;
        }
        let synchronizations = flow.synchronizations().unwrap_or_default();
        if !status.has_transaction() || status.is_new_transaction() {
            // This scope controls completion; invoke the callbacks now.
            sync_support::invoke_after_completion(&synchronizations, completion);
        } else if !synchronizations.is_empty() {
            // Participating in a transaction completed elsewhere; hand the
            // callbacks to the resource manager.
            if let Some(transaction) = status.transaction.as_ref() {
                self.manager.register_after_completion_with_existing(
                    flow,
                    transaction,
                    synchronizations,
                );
            }
        }
    }
}
