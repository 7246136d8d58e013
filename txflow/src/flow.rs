//! Flow-local registry for transactional state.
//!
//! A *flow* is the unit along which transactional context propagates: one
//! logical thread of work. All coordinator calls take an explicit
//! [`FlowContext`] handle instead of reaching for thread-local storage:
//! within one flow, `get_transaction`/`commit`/`rollback` observe one
//! another's effects; separate flows are fully independent.
//!
//! The registry stores three things per flow: resources bound by resource
//! managers (keyed by factory identity), the active synchronization list,
//! and the attributes of the active transaction (name, read-only flag,
//! isolation, actual-active marker). Binding the same key twice without
//! unbinding first is an error; lookups transparently evict holders that
//! were marked void.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use txflow_core::{
    Isolation, TransactionError, TransactionSynchronization, TxResult,
};

use crate::holder::ResourceHolder;

/// Identity key for a bound resource, usually derived from the resource
/// factory that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(usize);

impl ResourceKey {
    /// Key derived from the identity of a shared factory.
    ///
    /// Equals [`of`](Self::of) applied to the pointed-to value, so holders
    /// bound through an `Arc` and through a plain borrow of the same factory
    /// land on the same entry.
    #[must_use]
    pub fn of_arc<T: ?Sized>(factory: &Arc<T>) -> Self {
        Self::of(&**factory)
    }

    /// Key derived from the address of a borrowed factory, for factories
    /// with stable addresses such as `static` items.
    #[must_use]
    pub fn of<T: ?Sized>(factory: &T) -> Self {
        Self(factory as *const T as *const () as usize)
    }
}

/// Unwrap hook for registry keys.
///
/// A proxy that wraps a resource factory implements this to expose the key
/// of the factory it wraps, so resources bound through the proxy and through
/// the factory itself land on the same registry entry.
pub trait ResourceKeySource {
    /// The registry key this object stands for.
    fn resource_key(&self) -> ResourceKey;
}

#[derive(Default)]
struct FlowState {
    resources: HashMap<ResourceKey, Arc<dyn ResourceHolder>>,
    synchronizations: Option<Vec<Arc<dyn TransactionSynchronization>>>,
    transaction_name: Option<String>,
    read_only: bool,
    isolation: Option<Isolation>,
    actual_active: bool,
}

/// Handle to the transactional state of one logical flow.
///
/// The handle is cheap to clone; clones share the same state, which lets a
/// synchronization callback keep a handle to the flow it was registered on.
/// Cross-flow sharing of a handle is not supported: holders are owned by the
/// flow that bound them.
#[derive(Clone, Default)]
pub struct FlowContext {
    state: Arc<Mutex<FlowState>>,
}

impl FlowContext {
    /// Create an empty flow context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Resource bindings
    // ------------------------------------------------------------------

    /// Whether a live resource is bound for `key`.
    #[must_use]
    pub fn has_resource(&self, key: ResourceKey) -> bool {
        self.get_resource(key).is_some()
    }

    /// The resource bound for `key`, if any.
    ///
    /// Holders marked void are evicted here and reported as absent.
    #[must_use]
    pub fn get_resource(&self, key: ResourceKey) -> Option<Arc<dyn ResourceHolder>> {
        let mut state = self.state.lock();
        match state.resources.get(&key) {
            Some(holder) if holder.state().is_void() => {
                state.resources.remove(&key);
                None
            }
            Some(holder) => Some(Arc::clone(holder)),
            None => None,
        }
    }

    /// Bind `value` for `key`.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if a live resource is already bound for the
    /// key; a void leftover is silently replaced.
    pub fn bind_resource(
        &self,
        key: ResourceKey,
        value: Arc<dyn ResourceHolder>,
    ) -> TxResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.resources.get(&key) {
            if !existing.state().is_void() {
                return Err(TransactionError::IllegalState(format!(
                    "a resource is already bound for key {key:?}"
                )));
            }
        }
        state.resources.insert(key, value);
        trace!(?key, "bound resource to flow");
        Ok(())
    }

    /// Unbind and return the resource for `key`.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if no live resource is bound.
    pub fn unbind_resource(&self, key: ResourceKey) -> TxResult<Arc<dyn ResourceHolder>> {
        self.unbind_resource_if_possible(key).ok_or_else(|| {
            TransactionError::IllegalState(format!("no resource bound for key {key:?}"))
        })
    }

    /// Unbind the resource for `key` if one is bound, tolerating absence.
    pub fn unbind_resource_if_possible(
        &self,
        key: ResourceKey,
    ) -> Option<Arc<dyn ResourceHolder>> {
        let mut state = self.state.lock();
        let value = state.resources.remove(&key)?;
        if value.state().is_void() {
            return None;
        }
        trace!(?key, "unbound resource from flow");
        Some(value)
    }

    /// Keys of all live resources currently bound to the flow.
    #[must_use]
    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        let state = self.state.lock();
        state
            .resources
            .iter()
            .filter(|(_, holder)| !holder.state().is_void())
            .map(|(key, _)| *key)
            .collect()
    }

    // ------------------------------------------------------------------
    // Synchronization management
    // ------------------------------------------------------------------

    /// Whether synchronization is active for this flow.
    #[must_use]
    pub fn is_synchronization_active(&self) -> bool {
        self.state.lock().synchronizations.is_some()
    }

    /// Activate synchronization for this flow.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if synchronization is already active; at
    /// most one synchronization set exists per flow at any instant.
    pub fn init_synchronization(&self) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.synchronizations.is_some() {
            return Err(TransactionError::IllegalState(
                "cannot activate flow synchronization: already active".to_owned(),
            ));
        }
        trace!("initializing flow synchronization");
        state.synchronizations = Some(Vec::new());
        Ok(())
    }

    /// Register a synchronization callback with the active set.
    ///
    /// Registering the same callback instance twice is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if synchronization is not active.
    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn TransactionSynchronization>,
    ) -> TxResult<()> {
        let mut state = self.state.lock();
        let list = state.synchronizations.as_mut().ok_or_else(|| {
            TransactionError::IllegalState("flow synchronization is not active".to_owned())
        })?;
        if !list.iter().any(|existing| Arc::ptr_eq(existing, &synchronization)) {
            list.push(synchronization);
        }
        Ok(())
    }

    /// A snapshot of the registered synchronizations, stably sorted by
    /// ordering key.
    ///
    /// Callbacks invoked over the snapshot may register further
    /// synchronizations without disturbing the iteration.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if synchronization is not active.
    pub fn synchronizations(&self) -> TxResult<Vec<Arc<dyn TransactionSynchronization>>> {
        let state = self.state.lock();
        let list = state.synchronizations.as_ref().ok_or_else(|| {
            TransactionError::IllegalState("flow synchronization is not active".to_owned())
        })?;
        let mut snapshot = list.clone();
        snapshot.sort_by_key(|sync| sync.order());
        Ok(snapshot)
    }

    /// Deactivate synchronization for this flow.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if synchronization is not active.
    pub fn clear_synchronization(&self) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.synchronizations.take().is_none() {
            return Err(TransactionError::IllegalState(
                "cannot deactivate flow synchronization: not active".to_owned(),
            ));
        }
        trace!("cleared flow synchronization");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Active-transaction attributes
    // ------------------------------------------------------------------

    /// Name of the active transaction, if any.
    #[must_use]
    pub fn current_transaction_name(&self) -> Option<String> {
        self.state.lock().transaction_name.clone()
    }

    /// Expose (or reset, with `None`) the active transaction's name.
    pub fn set_current_transaction_name(&self, name: Option<String>) {
        self.state.lock().transaction_name = name;
    }

    /// Whether the active transaction is marked read-only.
    #[must_use]
    pub fn is_current_transaction_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    /// Expose the active transaction's read-only flag.
    pub fn set_current_transaction_read_only(&self, read_only: bool) {
        self.state.lock().read_only = read_only;
    }

    /// Isolation level of the active transaction, if one was specified.
    #[must_use]
    pub fn current_transaction_isolation(&self) -> Option<Isolation> {
        self.state.lock().isolation
    }

    /// Expose (or reset, with `None`) the active transaction's isolation.
    pub fn set_current_transaction_isolation(&self, isolation: Option<Isolation>) {
        self.state.lock().isolation = isolation;
    }

    /// Whether an actual physical transaction is active, as opposed to an
    /// empty scope with active synchronization only.
    #[must_use]
    pub fn is_actual_transaction_active(&self) -> bool {
        self.state.lock().actual_active
    }

    /// Expose the actual-transaction-active marker.
    pub fn set_actual_transaction_active(&self, active: bool) {
        self.state.lock().actual_active = active;
    }

    /// Clear synchronization and reset all per-flow attributes to defaults.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if synchronization is not active.
    pub fn clear(&self) -> TxResult<()> {
        self.clear_synchronization()?;
        let mut state = self.state.lock();
        state.transaction_name = None;
        state.read_only = false;
        state.isolation = None;
        state.actual_active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::{ResourceHolder, ResourceHolderState};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestHolder {
        state: ResourceHolderState,
    }

    impl TestHolder {
        fn new() -> Arc<Self> {
            Arc::new(Self { state: ResourceHolderState::new() })
        }
    }

    impl ResourceHolder for TestHolder {
        fn state(&self) -> &ResourceHolderState {
            &self.state
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct OrderedSync {
        order: i32,
        log: Arc<Mutex<Vec<i32>>>,
        tag: i32,
    }

    impl TransactionSynchronization for OrderedSync {
        fn order(&self) -> i32 {
            self.order
        }

        fn before_completion(&self) -> TxResult<()> {
            self.log.lock().push(self.tag);
            Ok(())
        }
    }

    #[test]
    fn test_key_identity_for_shared_and_borrowed_factories() {
        let holder = TestHolder::new();
        assert_eq!(ResourceKey::of_arc(&holder), ResourceKey::of(&*holder));

        let other = TestHolder::new();
        assert_ne!(ResourceKey::of_arc(&holder), ResourceKey::of_arc(&other));
    }

    #[test]
    fn test_binding_under_a_borrowed_factory_key() {
        static FACTORY: &str = "reporting-pool";

        let flow = FlowContext::new();
        let key = ResourceKey::of(FACTORY);
        flow.bind_resource(key, TestHolder::new()).expect("failed to bind");
        // Re-deriving the key from the same static factory finds the binding.
        assert!(flow.has_resource(ResourceKey::of(FACTORY)));
        flow.unbind_resource(key).expect("failed to unbind");
    }

    #[test]
    fn test_bind_and_unbind_resource() {
        let flow = FlowContext::new();
        let holder = TestHolder::new();
        let key = ResourceKey::of_arc(&holder);

        assert!(!flow.has_resource(key));
        flow.bind_resource(key, holder.clone()).expect("failed to bind");
        assert!(flow.has_resource(key));
        flow.unbind_resource(key).expect("failed to unbind");
        assert!(!flow.has_resource(key));
    }

    #[test]
    fn test_double_bind_fails() {
        let flow = FlowContext::new();
        let holder = TestHolder::new();
        let key = ResourceKey::of_arc(&holder);

        flow.bind_resource(key, holder.clone()).expect("failed to bind");
        let err = flow
            .bind_resource(key, TestHolder::new())
            .expect_err("second bind should fail");
        assert!(err.is_illegal_state());
        // The original binding must survive the rejected bind.
        assert!(flow.has_resource(key));
    }

    #[test]
    fn test_unbind_absent_fails() {
        let flow = FlowContext::new();
        let holder = TestHolder::new();
        let key = ResourceKey::of_arc(&holder);

        assert!(flow.unbind_resource(key).is_err());
        assert!(flow.unbind_resource_if_possible(key).is_none());
    }

    #[test]
    fn test_void_holder_behaves_as_absent() {
        let flow = FlowContext::new();
        let holder = TestHolder::new();
        let key = ResourceKey::of_arc(&holder);

        flow.bind_resource(key, holder.clone()).expect("failed to bind");
        holder.state().unbound();
        assert!(!flow.has_resource(key));
        // A void leftover does not block a fresh bind.
        flow.bind_resource(key, TestHolder::new()).expect("rebind over void holder failed");
    }

    #[test]
    fn test_synchronization_lifecycle() {
        let flow = FlowContext::new();
        assert!(!flow.is_synchronization_active());
        assert!(flow.register_synchronization(Arc::new(OrderedSync {
            order: 0,
            log: Arc::new(Mutex::new(Vec::new())),
            tag: 0,
        }))
        .is_err());

        flow.init_synchronization().expect("failed to init");
        assert!(flow.is_synchronization_active());
        assert!(flow.init_synchronization().is_err());

        flow.clear_synchronization().expect("failed to clear");
        assert!(!flow.is_synchronization_active());
        assert!(flow.clear_synchronization().is_err());
    }

    #[test]
    fn test_snapshot_is_stably_sorted() {
        let flow = FlowContext::new();
        flow.init_synchronization().expect("failed to init");
        let log = Arc::new(Mutex::new(Vec::new()));

        for (order, tag) in [(5, 1), (1, 2), (5, 3), (1, 4)] {
            flow.register_synchronization(Arc::new(OrderedSync {
                order,
                log: Arc::clone(&log),
                tag,
            }))
            .expect("failed to register");
        }

        for sync in flow.synchronizations().expect("failed to snapshot") {
            sync.before_completion().expect("callback failed");
        }
        // Ascending order keys; ties keep registration order.
        assert_eq!(*log.lock(), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let flow = FlowContext::new();
        flow.init_synchronization().expect("failed to init");
        let sync: Arc<dyn TransactionSynchronization> = Arc::new(OrderedSync {
            order: 0,
            log: Arc::new(Mutex::new(Vec::new())),
            tag: 0,
        });
        flow.register_synchronization(Arc::clone(&sync)).expect("failed to register");
        flow.register_synchronization(sync).expect("failed to register twice");
        assert_eq!(flow.synchronizations().expect("failed to snapshot").len(), 1);
    }

    #[test]
    fn test_callback_may_register_further_synchronizations() {
        struct Registering {
            flow: FlowContext,
            registered: Arc<AtomicUsize>,
        }

        impl TransactionSynchronization for Registering {
            fn before_completion(&self) -> TxResult<()> {
                let registered = Arc::clone(&self.registered);
                self.flow.register_synchronization(Arc::new(Counting { registered }))?;
                Ok(())
            }
        }

        struct Counting {
            registered: Arc<AtomicUsize>,
        }

        impl TransactionSynchronization for Counting {
            fn before_completion(&self) -> TxResult<()> {
                self.registered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let flow = FlowContext::new();
        flow.init_synchronization().expect("failed to init");
        let registered = Arc::new(AtomicUsize::new(0));
        flow.register_synchronization(Arc::new(Registering {
            flow: flow.clone(),
            registered: Arc::clone(&registered),
        }))
        .expect("failed to register");

        for sync in flow.synchronizations().expect("failed to snapshot") {
            sync.before_completion().expect("callback failed");
        }
        assert_eq!(flow.synchronizations().expect("failed to snapshot").len(), 2);
    }

    #[test]
    fn test_clear_resets_attributes() {
        let flow = FlowContext::new();
        flow.init_synchronization().expect("failed to init");
        flow.set_current_transaction_name(Some("order.create".to_owned()));
        flow.set_current_transaction_read_only(true);
        flow.set_current_transaction_isolation(Some(Isolation::Serializable));
        flow.set_actual_transaction_active(true);

        flow.clear().expect("failed to clear");
        assert!(!flow.is_synchronization_active());
        assert!(flow.current_transaction_name().is_none());
        assert!(!flow.is_current_transaction_read_only());
        assert!(flow.current_transaction_isolation().is_none());
        assert!(!flow.is_actual_transaction_active());
    }
}
