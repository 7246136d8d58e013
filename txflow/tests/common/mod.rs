//! Shared test support: a resource manager that records a trace of every
//! hook invocation, and a synchronization that does the same.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use txflow::{
    CompletionStatus, FlowContext, ResourceManager, Savepoint, SavepointManager,
    SuspendedResources, TransactionDefinition, TransactionError, TransactionObject,
    TransactionSynchronization, TxResult,
};

/// Shared, clonable recorder of events in invocation order.
#[derive(Clone, Default, Debug)]
pub struct Trace {
    events: Arc<Mutex<Vec<String>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

/// One physical transaction as the mock manager sees it.
#[derive(Debug)]
pub struct PhysicalTx {
    pub id: u64,
    pub rollback_only: AtomicBool,
}

/// Transaction object handed to the coordinator by [`MockResourceManager`].
#[derive(Debug)]
pub struct MockTransaction {
    physical: Option<Arc<PhysicalTx>>,
    savepoints_enabled: bool,
    savepoint_seq: Arc<AtomicU64>,
    trace: Trace,
}

impl MockTransaction {
    pub fn physical(&self) -> Option<&Arc<PhysicalTx>> {
        self.physical.as_ref()
    }
}

impl TransactionObject for MockTransaction {
    fn is_rollback_only(&self) -> bool {
        self.physical.as_ref().is_some_and(|p| p.rollback_only.load(Ordering::Acquire))
    }

    fn savepoint_manager(&mut self) -> Option<&mut dyn SavepointManager> {
        if self.savepoints_enabled && self.physical.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl SavepointManager for MockTransaction {
    fn create_savepoint(&mut self) -> TxResult<Savepoint> {
        let seq = self.savepoint_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.trace.record(format!("create_savepoint(sp{seq})"));
        Ok(Savepoint::new(seq))
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()> {
        let seq = savepoint
            .downcast_ref::<u64>()
            .ok_or_else(|| TransactionError::IllegalState("foreign savepoint".to_owned()))?;
        self.trace.record(format!("rollback_to_savepoint(sp{seq})"));
        Ok(())
    }

    fn release_savepoint(&mut self, savepoint: Savepoint) -> TxResult<()> {
        let seq = savepoint
            .downcast_ref::<u64>()
            .copied()
            .ok_or_else(|| TransactionError::IllegalState("foreign savepoint".to_owned()))?;
        self.trace.record(format!("release_savepoint(sp{seq})"));
        Ok(())
    }
}

/// A resource manager that records every hook invocation and supports
/// scripted failures.
pub struct MockResourceManager {
    trace: Trace,
    current: Mutex<Option<Arc<PhysicalTx>>>,
    stacked: Mutex<Vec<Arc<PhysicalTx>>>,
    next_id: AtomicU64,
    savepoint_seq: Arc<AtomicU64>,
    savepoints_enabled: bool,
    savepoint_for_nested: bool,
    commit_on_global_rollback_only: bool,
    fail_begin: Mutex<Option<TransactionError>>,
    fail_commit: Mutex<Option<TransactionError>>,
    fail_rollback: Mutex<Option<TransactionError>>,
}

impl MockResourceManager {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            current: Mutex::new(None),
            stacked: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            savepoint_seq: Arc::new(AtomicU64::new(0)),
            savepoints_enabled: true,
            savepoint_for_nested: true,
            commit_on_global_rollback_only: false,
            fail_begin: Mutex::new(None),
            fail_commit: Mutex::new(None),
            fail_rollback: Mutex::new(None),
        }
    }

    pub fn without_savepoints(mut self) -> Self {
        self.savepoints_enabled = false;
        self
    }

    /// Handle nested scopes through a nested `begin` on the same
    /// transaction object instead of a savepoint.
    pub fn nested_via_begin(mut self) -> Self {
        self.savepoint_for_nested = false;
        self
    }

    /// Report a transaction this manager did not begin, as if it were
    /// started and completed by an external coordinator.
    pub fn with_external_transaction(self) -> Self {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        *self.current.lock() =
            Some(Arc::new(PhysicalTx { id, rollback_only: AtomicBool::new(false) }));
        self
    }

    pub fn commit_on_global_rollback_only(mut self) -> Self {
        self.commit_on_global_rollback_only = true;
        self
    }

    /// Script the next `begin` to fail.
    pub fn fail_next_begin(&self, err: TransactionError) {
        *self.fail_begin.lock() = Some(err);
    }

    /// Script the next `commit` to fail.
    pub fn fail_next_commit(&self, err: TransactionError) {
        *self.fail_commit.lock() = Some(err);
    }

    /// Script the next `rollback` to fail.
    pub fn fail_next_rollback(&self, err: TransactionError) {
        *self.fail_rollback.lock() = Some(err);
    }

    /// The physical transaction the manager currently considers active.
    pub fn current_physical(&self) -> Option<Arc<PhysicalTx>> {
        self.current.lock().clone()
    }
}

impl ResourceManager for MockResourceManager {
    type Transaction = MockTransaction;

    fn current_transaction(&self, _flow: &FlowContext) -> TxResult<MockTransaction> {
        self.trace.record("get_transaction");
        Ok(MockTransaction {
            physical: self.current.lock().clone(),
            savepoints_enabled: self.savepoints_enabled,
            savepoint_seq: Arc::clone(&self.savepoint_seq),
            trace: self.trace.clone(),
        })
    }

    fn is_existing(&self, transaction: &MockTransaction) -> bool {
        transaction.physical.is_some()
    }

    fn begin(
        &self,
        _flow: &FlowContext,
        transaction: &mut MockTransaction,
        _definition: &TransactionDefinition,
    ) -> TxResult<()> {
        if let Some(err) = self.fail_begin.lock().take() {
            self.trace.record("begin_failed");
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let physical = Arc::new(PhysicalTx { id, rollback_only: AtomicBool::new(false) });
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            // Nested begin on top of a live transaction; stack the outer.
            self.stacked.lock().push(previous);
        }
        *current = Some(Arc::clone(&physical));
        transaction.physical = Some(physical);
        self.trace.record(format!("begin(tx{id})"));
        Ok(())
    }

    fn use_savepoint_for_nested(&self) -> bool {
        self.savepoint_for_nested
    }

    fn suspend(
        &self,
        _flow: &FlowContext,
        transaction: &mut MockTransaction,
    ) -> TxResult<SuspendedResources> {
        let physical = self.current.lock().take().ok_or_else(|| {
            TransactionError::IllegalState("no transaction to suspend".to_owned())
        })?;
        transaction.physical = None;
        self.trace.record(format!("suspend(tx{})", physical.id));
        Ok(Box::new(physical))
    }

    fn resume(
        &self,
        _flow: &FlowContext,
        transaction: Option<&mut MockTransaction>,
        resources: SuspendedResources,
    ) -> TxResult<()> {
        let physical = resources.downcast::<Arc<PhysicalTx>>().map_err(|_| {
            TransactionError::IllegalState("foreign suspended resources".to_owned())
        })?;
        self.trace.record(format!("resume(tx{})", physical.id));
        *self.current.lock() = Some(Arc::clone(&physical));
        if let Some(transaction) = transaction {
            transaction.physical = Some(*physical);
        }
        Ok(())
    }

    fn should_commit_on_global_rollback_only(&self) -> bool {
        self.commit_on_global_rollback_only
    }

    fn prepare_for_commit(
        &self,
        _flow: &FlowContext,
        _transaction: &mut MockTransaction,
    ) -> TxResult<()> {
        self.trace.record("prepare_for_commit");
        Ok(())
    }

    fn commit(&self, _flow: &FlowContext, transaction: &mut MockTransaction) -> TxResult<()> {
        let id = transaction.physical.as_ref().map_or(0, |p| p.id);
        self.trace.record(format!("commit(tx{id})"));
        if let Some(err) = self.fail_commit.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    fn rollback(&self, _flow: &FlowContext, transaction: &mut MockTransaction) -> TxResult<()> {
        let id = transaction.physical.as_ref().map_or(0, |p| p.id);
        self.trace.record(format!("rollback(tx{id})"));
        if let Some(err) = self.fail_rollback.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    fn set_rollback_only(
        &self,
        _flow: &FlowContext,
        transaction: &mut MockTransaction,
    ) -> TxResult<()> {
        let physical = transaction.physical.as_ref().ok_or_else(|| {
            TransactionError::IllegalState("no transaction to mark".to_owned())
        })?;
        physical.rollback_only.store(true, Ordering::Release);
        self.trace.record(format!("set_rollback_only(tx{})", physical.id));
        Ok(())
    }

    fn cleanup_after_completion(&self, _flow: &FlowContext, transaction: &mut MockTransaction) {
        self.trace.record("cleanup");
        let mut current = self.current.lock();
        if let (Some(cur), Some(own)) = (current.as_ref(), transaction.physical.as_ref()) {
            if Arc::ptr_eq(cur, own) {
                *current = self.stacked.lock().pop();
            }
        }
        transaction.physical = None;
    }
}

/// A synchronization that records every callback, optionally failing on
/// scripted hooks.
pub struct TraceSync {
    trace: Trace,
    label: String,
    order: i32,
    fail_before_commit: AtomicBool,
    fail_before_completion: AtomicBool,
    fail_after_commit: AtomicBool,
    fail_after_completion: AtomicBool,
}

impl TraceSync {
    pub fn new(trace: Trace) -> Self {
        Self::labeled(trace, "")
    }

    pub fn labeled(trace: Trace, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            trace,
            label,
            order: txflow::LOWEST_PRECEDENCE,
            fail_before_commit: AtomicBool::new(false),
            fail_before_completion: AtomicBool::new(false),
            fail_after_commit: AtomicBool::new(false),
            fail_after_completion: AtomicBool::new(false),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn failing_before_commit(self) -> Self {
        self.fail_before_commit.store(true, Ordering::Release);
        self
    }

    pub fn failing_before_completion(self) -> Self {
        self.fail_before_completion.store(true, Ordering::Release);
        self
    }

    pub fn failing_after_commit(self) -> Self {
        self.fail_after_commit.store(true, Ordering::Release);
        self
    }

    pub fn failing_after_completion(self) -> Self {
        self.fail_after_completion.store(true, Ordering::Release);
        self
    }

    fn event(&self, hook: &str) -> String {
        if self.label.is_empty() {
            hook.to_owned()
        } else {
            format!("{}:{hook}", self.label)
        }
    }
}

impl TransactionSynchronization for TraceSync {
    fn order(&self) -> i32 {
        self.order
    }

    fn suspend(&self) {
        self.trace.record(self.event("sync_suspend"));
    }

    fn resume(&self) {
        self.trace.record(self.event("sync_resume"));
    }

    fn flush(&self) -> TxResult<()> {
        self.trace.record(self.event("sync_flush"));
        Ok(())
    }

    fn before_commit(&self, read_only: bool) -> TxResult<()> {
        self.trace.record(self.event(&format!("before_commit({read_only})")));
        if self.fail_before_commit.load(Ordering::Acquire) {
            return Err(TransactionError::Resource("before_commit failure".to_owned()));
        }
        Ok(())
    }

    fn before_completion(&self) -> TxResult<()> {
        self.trace.record(self.event("before_completion"));
        if self.fail_before_completion.load(Ordering::Acquire) {
            return Err(TransactionError::Resource("before_completion failure".to_owned()));
        }
        Ok(())
    }

    fn after_commit(&self) -> TxResult<()> {
        self.trace.record(self.event("after_commit"));
        if self.fail_after_commit.load(Ordering::Acquire) {
            return Err(TransactionError::Resource("after_commit failure".to_owned()));
        }
        Ok(())
    }

    fn after_completion(&self, status: CompletionStatus) -> TxResult<()> {
        self.trace.record(self.event(&format!("after_completion({status:?})")));
        if self.fail_after_completion.load(Ordering::Acquire) {
            return Err(TransactionError::Resource("after_completion failure".to_owned()));
        }
        Ok(())
    }
}
