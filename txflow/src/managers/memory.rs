//! An in-memory resource manager with full savepoint support.
//!
//! [`MemoryStore`] plays the resource-factory role: committed key-value data
//! shared by every transaction of the store. A physical transaction buffers
//! its writes in a session bound to the flow registry; commit applies the
//! buffer to the store, rollback discards it, and savepoints are watermarks
//! into the buffer. This is the reference manager used by the crate's tests
//! and benches, and a template for writing managers over real resources.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use txflow_core::{
    Savepoint, SavepointManager, TransactionDefinition, TransactionError, TxResult,
    TIMEOUT_DEFAULT,
};

use crate::flow::{FlowContext, ResourceKey, ResourceKeySource};
use crate::holder::{ResourceHolder, ResourceHolderState};
use crate::manager::{ResourceManager, SuspendedResources, TransactionObject};

/// Committed key-value data shared by every transaction of one store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether the store has no committed entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn apply(&self, ops: &[WriteOp]) {
        let mut data = self.data.lock();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
    }
}

/// A buffered write against the store.
#[derive(Debug, Clone)]
enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Debug, Default)]
struct Session {
    ops: Vec<WriteOp>,
    savepoint_seq: u64,
}

/// Resource holder for one physical memory transaction, bound to the flow
/// under the store's key while the transaction is active.
#[derive(Debug, Default)]
pub struct MemorySessionHolder {
    state: ResourceHolderState,
    session: Mutex<Session>,
}

impl MemorySessionHolder {
    fn new() -> Self {
        Self::default()
    }
}

impl ResourceHolder for MemorySessionHolder {
    fn state(&self) -> &ResourceHolderState {
        &self.state
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Watermark into a session's write log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemorySavepoint {
    index: usize,
    seq: u64,
}

/// Transaction object for the memory manager.
///
/// Writes buffer into the session and become visible in the store only on
/// commit; reads see the transaction's own buffered writes first.
pub struct MemoryTransaction {
    store: Arc<MemoryStore>,
    holder: Option<Arc<MemorySessionHolder>>,
}

impl MemoryTransaction {
    fn require_holder(&self) -> TxResult<&Arc<MemorySessionHolder>> {
        self.holder.as_ref().ok_or_else(|| {
            TransactionError::IllegalState("no active memory transaction".to_owned())
        })
    }

    /// The session holder, when a transaction is active.
    #[must_use]
    pub fn session_holder(&self) -> Option<&Arc<MemorySessionHolder>> {
        self.holder.as_ref()
    }

    /// Buffer a write of `value` under `key`.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` when no transaction is active.
    pub fn put(&self, key: &str, value: &[u8]) -> TxResult<()> {
        let holder = self.require_holder()?;
        holder.session.lock().ops.push(WriteOp::Put {
            key: key.to_owned(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Buffer a deletion of `key`.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` when no transaction is active.
    pub fn delete(&self, key: &str) -> TxResult<()> {
        let holder = self.require_holder()?;
        holder.session.lock().ops.push(WriteOp::Delete { key: key.to_owned() });
        Ok(())
    }

    /// Read `key`, seeing this transaction's own buffered writes first.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` when no transaction is active.
    pub fn get(&self, key: &str) -> TxResult<Option<Vec<u8>>> {
        let holder = self.require_holder()?;
        let session = holder.session.lock();
        for op in session.ops.iter().rev() {
            match op {
                WriteOp::Put { key: k, value } if k == key => return Ok(Some(value.clone())),
                WriteOp::Delete { key: k } if k == key => return Ok(None),
                _ => {}
            }
        }
        Ok(self.store.get(key))
    }
}

impl TransactionObject for MemoryTransaction {
    fn is_rollback_only(&self) -> bool {
        self.holder.as_ref().is_some_and(|holder| holder.state.is_rollback_only())
    }

    fn savepoint_manager(&mut self) -> Option<&mut dyn SavepointManager> {
        if self.holder.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl SavepointManager for MemoryTransaction {
    fn create_savepoint(&mut self) -> TxResult<Savepoint> {
        let holder = self.require_holder()?;
        let mut session = holder.session.lock();
        session.savepoint_seq += 1;
        let savepoint = MemorySavepoint { index: session.ops.len(), seq: session.savepoint_seq };
        trace!(index = savepoint.index, seq = savepoint.seq, "created savepoint");
        Ok(Savepoint::new(savepoint))
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()> {
        let mark = savepoint.downcast_ref::<MemorySavepoint>().ok_or_else(|| {
            TransactionError::IllegalState(
                "savepoint does not belong to a memory transaction".to_owned(),
            )
        })?;
        let holder = self.require_holder()?;
        let mut session = holder.session.lock();
        if mark.index > session.ops.len() {
            return Err(TransactionError::IllegalState(
                "savepoint is no longer valid for this transaction".to_owned(),
            ));
        }
        trace!(index = mark.index, "rolled back to savepoint");
        session.ops.truncate(mark.index);
        Ok(())
    }

    fn release_savepoint(&mut self, savepoint: Savepoint) -> TxResult<()> {
        savepoint.downcast_ref::<MemorySavepoint>().ok_or_else(|| {
            TransactionError::IllegalState(
                "savepoint does not belong to a memory transaction".to_owned(),
            )
        })?;
        Ok(())
    }
}

/// Resource manager over a [`MemoryStore`].
pub struct MemoryResourceManager {
    store: Arc<MemoryStore>,
}

impl MemoryResourceManager {
    /// Create a manager for the given store.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// The store this manager coordinates.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The registry key this manager binds its sessions under.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        self.resource_key()
    }
}

impl ResourceKeySource for MemoryResourceManager {
    // The manager is a thin handle; sessions are keyed by the store it
    // wraps, so two managers over one store share bindings.
    fn resource_key(&self) -> ResourceKey {
        ResourceKey::of_arc(&self.store)
    }
}

impl ResourceManager for MemoryResourceManager {
    type Transaction = MemoryTransaction;

    fn current_transaction(&self, flow: &FlowContext) -> TxResult<MemoryTransaction> {
        let holder = flow
            .get_resource(self.key())
            .and_then(|holder| holder.as_any_arc().downcast::<MemorySessionHolder>().ok());
        Ok(MemoryTransaction { store: Arc::clone(&self.store), holder })
    }

    fn is_existing(&self, transaction: &MemoryTransaction) -> bool {
        transaction.holder.is_some()
    }

    fn begin(
        &self,
        flow: &FlowContext,
        transaction: &mut MemoryTransaction,
        definition: &TransactionDefinition,
    ) -> TxResult<()> {
        let holder = Arc::new(MemorySessionHolder::new());
        holder.state.set_synchronized_with_transaction(true);
        holder.state.requested();
        if definition.timeout_seconds != TIMEOUT_DEFAULT {
            holder
                .state
                .set_timeout_in_seconds(u32::try_from(definition.timeout_seconds).unwrap_or(0));
        }
        flow.bind_resource(self.key(), Arc::clone(&holder) as Arc<dyn ResourceHolder>)?;
        transaction.holder = Some(holder);
        trace!("began memory transaction");
        Ok(())
    }

    fn suspend(
        &self,
        flow: &FlowContext,
        transaction: &mut MemoryTransaction,
    ) -> TxResult<SuspendedResources> {
        flow.unbind_resource(self.key())?;
        let holder = transaction.holder.take().ok_or_else(|| {
            TransactionError::IllegalState("no active memory transaction to suspend".to_owned())
        })?;
        Ok(Box::new(holder))
    }

    fn resume(
        &self,
        flow: &FlowContext,
        transaction: Option<&mut MemoryTransaction>,
        resources: SuspendedResources,
    ) -> TxResult<()> {
        let holder = resources.downcast::<Arc<MemorySessionHolder>>().map_err(|_| {
            TransactionError::IllegalState(
                "suspended resources do not belong to a memory transaction".to_owned(),
            )
        })?;
        flow.bind_resource(self.key(), Arc::clone(&*holder) as Arc<dyn ResourceHolder>)?;
        if let Some(transaction) = transaction {
            transaction.holder = Some(*holder);
        }
        Ok(())
    }

    fn commit(&self, _flow: &FlowContext, transaction: &mut MemoryTransaction) -> TxResult<()> {
        let holder = transaction.require_holder()?;
        let session = holder.session.lock();
        self.store.apply(&session.ops);
        trace!(ops = session.ops.len(), "committed memory transaction");
        Ok(())
    }

    fn rollback(&self, _flow: &FlowContext, transaction: &mut MemoryTransaction) -> TxResult<()> {
        let holder = transaction.require_holder()?;
        let mut session = holder.session.lock();
        trace!(ops = session.ops.len(), "rolled back memory transaction");
        session.ops.clear();
        Ok(())
    }

    fn set_rollback_only(
        &self,
        _flow: &FlowContext,
        transaction: &mut MemoryTransaction,
    ) -> TxResult<()> {
        transaction.require_holder()?.state.set_rollback_only();
        Ok(())
    }

    fn cleanup_after_completion(&self, flow: &FlowContext, transaction: &mut MemoryTransaction) {
        if let Some(holder) = flow.unbind_resource_if_possible(self.key()) {
            holder.state().released();
        }
        if let Some(holder) = transaction.holder.take() {
            holder.session.lock().ops.clear();
            holder.state.clear();
        }
    }
}
