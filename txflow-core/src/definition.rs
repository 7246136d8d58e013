//! Transaction definitions: the immutable description of the behavior a
//! caller wants from a transactional scope.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sentinel timeout meaning "use the resource manager's default".
pub const TIMEOUT_DEFAULT: i32 = -1;

/// How a requested scope relates to a transaction already active on the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the current transaction, or start a new one if none exists.
    #[default]
    Required,

    /// Join the current transaction if one exists, otherwise run in an empty
    /// scope without a physical transaction.
    Supports,

    /// Join the current transaction; fail if none exists.
    Mandatory,

    /// Always start a new physical transaction, suspending any current one.
    RequiresNew,

    /// Run without a transaction, suspending any current one.
    NotSupported,

    /// Run without a transaction; fail if one exists.
    Never,

    /// Run in a nested transaction if one is active (usually a savepoint),
    /// otherwise start a new transaction like `Required`.
    Nested,
}

/// Isolation level requested for a new physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Whatever the resource manager considers its default.
    #[default]
    Default,
    /// Dirty reads, non-repeatable reads, and phantoms may occur.
    ReadUncommitted,
    /// Dirty reads are prevented.
    ReadCommitted,
    /// Dirty and non-repeatable reads are prevented.
    RepeatableRead,
    /// Full serializable isolation.
    Serializable,
}

/// Predicate deciding whether an application error should roll the
/// transaction back.
///
/// The default rule rolls back on every error. Custom rules are consulted by
/// the execute-around API when the transactional closure fails; they never
/// affect explicit `commit`/`rollback` calls.
#[derive(Clone, Default)]
pub struct RollbackRules {
    predicate: Option<Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>>,
}

impl RollbackRules {
    /// The default rule: every error rolls back.
    #[must_use]
    pub fn rollback_always() -> Self {
        Self::default()
    }

    /// Roll back only when `predicate` returns `true` for the error.
    pub fn rollback_when<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        Self { predicate: Some(Arc::new(predicate)) }
    }

    /// Whether the given application error should trigger a rollback.
    #[must_use]
    pub fn should_rollback(&self, error: &(dyn StdError + 'static)) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(error))
    }
}

impl fmt::Debug for RollbackRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.predicate {
            Some(_) => f.write_str("RollbackRules(custom)"),
            None => f.write_str("RollbackRules(always)"),
        }
    }
}

/// Immutable description of the transactional behavior a caller wants.
///
/// A definition is handed to the coordinator when entering a scope and never
/// consulted again after the scope is established. The builder-style `with_*`
/// methods cover the common cases:
///
/// ```
/// use txflow_core::{Isolation, Propagation, TransactionDefinition};
///
/// let def = TransactionDefinition::new()
///     .with_propagation(Propagation::RequiresNew)
///     .with_isolation(Isolation::Serializable)
///     .with_timeout(30)
///     .with_name("billing.charge");
/// assert!(!def.read_only);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDefinition {
    /// How this scope relates to an existing transaction.
    pub propagation: Propagation,

    /// Requested isolation level; `Default` defers to the resource manager.
    pub isolation: Isolation,

    /// Timeout in seconds, or [`TIMEOUT_DEFAULT`] for the manager default.
    pub timeout_seconds: i32,

    /// Hint that the scope performs no writes.
    pub read_only: bool,

    /// Optional name, exposed on the flow while the scope is active.
    pub name: Option<String>,

    /// Rollback decision for application errors in the execute-around API.
    #[serde(skip)]
    pub rollback_rules: RollbackRules,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            isolation: Isolation::Default,
            timeout_seconds: TIMEOUT_DEFAULT,
            read_only: false,
            name: None,
            rollback_rules: RollbackRules::default(),
        }
    }
}

impl TransactionDefinition {
    /// Create a definition with default behavior: `Required` propagation,
    /// default isolation, manager timeout, writable, unnamed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the propagation behavior.
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the isolation level.
    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the timeout in seconds.
    #[must_use]
    pub fn with_timeout(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Mark the scope read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Name the scope.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the rollback rules consulted by the execute-around API.
    #[must_use]
    pub fn with_rollback_rules(mut self, rules: RollbackRules) -> Self {
        self.rollback_rules = rules;
        self
    }
}
