//! Core types for the `txflow` transaction framework.
//!
//! This crate holds the contracts shared between the coordinator and
//! resource managers:
//!
//! - [`TransactionDefinition`]: the immutable description of the behavior a
//!   caller wants (propagation, isolation, timeout, read-only, name,
//!   rollback rules)
//! - [`TransactionError`]: the error taxonomy for the whole framework
//! - [`TransactionSynchronization`]: lifecycle callbacks fired around
//!   commit and rollback boundaries
//! - [`SavepointManager`] and [`Savepoint`]: the nested-transaction
//!   protocol
//!
//! The coordinator itself, the flow-local registry, and the resource-manager
//! template live in the main `txflow` crate.

mod definition;
mod error;
mod savepoint;
mod sync;

pub use definition::{
    Isolation, Propagation, RollbackRules, TransactionDefinition, TIMEOUT_DEFAULT,
};
pub use error::{TransactionError, TxResult};
pub use savepoint::{Savepoint, SavepointManager};
pub use sync::{CompletionStatus, TransactionSynchronization, LOWEST_PRECEDENCE};
