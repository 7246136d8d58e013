//! `txflow`: generic transaction coordination.
//!
//! txflow decouples application code from any specific transactional
//! resource. Callers declare *what* semantics they need (propagation
//! behavior, isolation level, timeout, read-only hint, rollback rules) and
//! the [`TransactionCoordinator`] orchestrates *when* to begin, suspend,
//! resume, commit, or roll back an underlying transaction supplied by a
//! pluggable [`ResourceManager`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                      │
//! │  - propagation state machine, suspension stack              │
//! │  - synchronization triggering, savepoint orchestration      │
//! │  - commit/rollback workflow and error mapping               │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │       FlowContext        │   │       ResourceManager        │
//! │  - bound resources       │   │  - begin / commit / rollback │
//! │  - synchronization set   │   │  - suspend / resume          │
//! │  - transaction attrs     │   │  - rollback-only marking     │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! All state is keyed by an explicit [`FlowContext`], the unit along which
//! transactional context propagates. There are no thread-locals and no
//! background threads: every call, including all callbacks, runs to
//! completion on the invoking flow.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use txflow::managers::{MemoryResourceManager, MemoryStore};
//! use txflow::{
//!     FlowContext, Propagation, TransactionCoordinator, TransactionDefinition,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let coordinator =
//!     TransactionCoordinator::new(MemoryResourceManager::new(Arc::clone(&store)));
//! let flow = FlowContext::new();
//!
//! // Outer scope.
//! let def = TransactionDefinition::new().with_name("transfer");
//! let mut outer = coordinator.get_transaction(&flow, Some(&def)).unwrap();
//! outer.transaction().unwrap().put("from", b"90").unwrap();
//!
//! // Inner scope joins the same transaction.
//! let inner_def = TransactionDefinition::new().with_propagation(Propagation::Required);
//! let mut inner = coordinator.get_transaction(&flow, Some(&inner_def)).unwrap();
//! assert!(!inner.is_new_transaction());
//! inner.transaction().unwrap().put("to", b"110").unwrap();
//! coordinator.commit(&flow, &mut inner).unwrap();
//!
//! coordinator.commit(&flow, &mut outer).unwrap();
//! assert_eq!(store.get("to"), Some(b"110".to_vec()));
//! ```

pub mod coordinator;
pub mod flow;
pub mod holder;
pub mod manager;
pub mod managers;
pub mod status;
mod sync_support;
mod template;

pub use coordinator::{CoordinatorConfig, SyncMode, TransactionCoordinator};
pub use flow::{FlowContext, ResourceKey, ResourceKeySource};
pub use holder::{ResourceHolder, ResourceHolderState};
pub use manager::{ResourceManager, SuspendedResources, TransactionObject};
pub use status::{SuspendedScope, TransactionStatus};
pub use sync_support::invoke_after_completion;
pub use template::ExecuteError;

pub use txflow_core::{
    CompletionStatus, Isolation, Propagation, RollbackRules, Savepoint, SavepointManager,
    TransactionDefinition, TransactionError, TransactionSynchronization, TxResult,
    LOWEST_PRECEDENCE, TIMEOUT_DEFAULT,
};
