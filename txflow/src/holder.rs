//! Resource holders: reference-counted, timeout-aware wrappers around a
//! resource acquired for a transaction.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use txflow_core::{TransactionError, TxResult};

/// Shared bookkeeping for a resource bound into the flow registry.
///
/// Resource managers embed this state in their holder types and expose it
/// through [`ResourceHolder::state`]. The fields mirror what the registry
/// and the coordinator need to observe: whether the holder participates in a
/// transaction, the local rollback-only marker, the expiration deadline, a
/// reference count for idle-cleanup decisions, and the `void` flag that makes
/// a stale holder behave as absent on lookup.
#[derive(Debug, Default)]
pub struct ResourceHolderState {
    synchronized_with_transaction: AtomicBool,
    rollback_only: AtomicBool,
    is_void: AtomicBool,
    reference_count: AtomicU32,
    deadline: Mutex<Option<Instant>>,
}

impl ResourceHolderState {
    /// Create fresh holder state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the resource as synchronized with a transaction.
    pub fn set_synchronized_with_transaction(&self, synchronized: bool) {
        self.synchronized_with_transaction.store(synchronized, Ordering::Release);
    }

    /// Whether the resource is synchronized with a transaction.
    #[must_use]
    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.synchronized_with_transaction.load(Ordering::Acquire)
    }

    /// Mark the resource transaction rollback-only.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Release);
    }

    /// Whether the resource transaction is marked rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Acquire)
    }

    /// Set the expiration deadline `seconds` from now.
    pub fn set_timeout_in_seconds(&self, seconds: u32) {
        self.set_timeout_in_millis(u64::from(seconds) * 1_000);
    }

    /// Set the expiration deadline `millis` from now.
    pub fn set_timeout_in_millis(&self, millis: u64) {
        *self.deadline.lock() = Some(Instant::now() + Duration::from_millis(millis));
    }

    /// Whether a deadline has been set.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.deadline.lock().is_some()
    }

    /// The expiration deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Remaining time to live in milliseconds.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` if no deadline was set. If the deadline has
    /// been reached, marks the holder rollback-only and fails with
    /// `TimedOut`.
    pub fn time_to_live_millis(&self) -> TxResult<u64> {
        let deadline = self.deadline.lock().ok_or_else(|| {
            TransactionError::IllegalState(
                "no timeout specified for this resource holder".to_owned(),
            )
        })?;
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            self.set_rollback_only();
            let overdue = now.saturating_duration_since(deadline);
            return Err(TransactionError::TimedOut {
                overdue_millis: u64::try_from(overdue.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
    }

    /// Remaining time to live in whole seconds, rounded up.
    ///
    /// # Errors
    ///
    /// Same conditions as [`time_to_live_millis`](Self::time_to_live_millis).
    pub fn time_to_live_seconds(&self) -> TxResult<u32> {
        let millis = self.time_to_live_millis()?;
        let seconds = millis.div_ceil(1_000);
        Ok(u32::try_from(seconds).unwrap_or(u32::MAX))
    }

    /// Record that the held resource was requested.
    pub fn requested(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that the held resource was released.
    pub fn released(&self) {
        let _ = self.reference_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| Some(count.saturating_sub(1)),
        );
    }

    /// Whether there are still open references to this holder.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.reference_count.load(Ordering::Acquire) > 0
    }

    /// Clear the transactional state, preserving the reference count.
    pub fn clear(&self) {
        self.synchronized_with_transaction.store(false, Ordering::Release);
        self.rollback_only.store(false, Ordering::Release);
        *self.deadline.lock() = None;
    }

    /// Reset everything, including the reference count.
    pub fn reset(&self) {
        self.clear();
        self.reference_count.store(0, Ordering::Release);
    }

    /// Mark the holder as unbound; registry lookups will ignore it.
    pub fn unbound(&self) {
        self.is_void.store(true, Ordering::Release);
    }

    /// Whether the holder has been voided.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.is_void.load(Ordering::Acquire)
    }
}

/// A resource that can be bound into the flow registry.
pub trait ResourceHolder: Send + Sync {
    /// Shared holder bookkeeping.
    fn state(&self) -> &ResourceHolderState;

    /// Downcast hook so a resource manager can recover its own holder type
    /// from the registry.
    fn as_any_arc(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Any + Send + Sync>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reference_counting() {
        let state = ResourceHolderState::new();
        assert!(!state.is_open());
        state.requested();
        state.requested();
        assert!(state.is_open());
        state.released();
        assert!(state.is_open());
        state.released();
        assert!(!state.is_open());
        // Extra release must not wrap around.
        state.released();
        assert!(!state.is_open());
    }

    #[test]
    fn test_clear_preserves_reference_count() {
        let state = ResourceHolderState::new();
        state.requested();
        state.set_rollback_only();
        state.set_timeout_in_seconds(10);
        state.clear();
        assert!(state.is_open());
        assert!(!state.is_rollback_only());
        assert!(!state.has_timeout());
        state.reset();
        assert!(!state.is_open());
    }

    #[test]
    fn test_ttl_without_timeout_is_illegal() {
        let state = ResourceHolderState::new();
        let err = state.time_to_live_millis().expect_err("expected missing-timeout failure");
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        let state = ResourceHolderState::new();
        state.set_timeout_in_millis(9_001);
        let seconds = state.time_to_live_seconds().expect("deadline should be in the future");
        assert_eq!(seconds, 10);
    }

    #[test]
    fn test_elapsed_deadline_marks_rollback_only() {
        let state = ResourceHolderState::new();
        state.set_timeout_in_millis(10);
        thread::sleep(Duration::from_millis(20));
        let err = state.time_to_live_millis().expect_err("deadline should have passed");
        assert!(err.is_timeout());
        assert!(state.is_rollback_only());
    }

    #[test]
    fn test_unbound_voids_holder() {
        let state = ResourceHolderState::new();
        assert!(!state.is_void());
        state.unbound();
        assert!(state.is_void());
    }
}
