//! Per-role task lifecycle controllers.
//!
//! Each role owns its state outright: the task->cid map lives in the
//! provider controller, purchase tracking in the buyer controller, and the
//! only mutable state shared between concurrent handlers in one role is the
//! per-task in-flight set below.

pub mod buyer;
pub mod provider;

use std::collections::HashSet;
use std::sync::Mutex;

/// What a guarded lifecycle action did. Skips and stale aborts are normal
/// operation, not errors; callers and tests branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// A transaction was submitted (confirmed or pending).
    Submitted,
    /// Ledger already shows the target state; nothing to do.
    SkippedAlreadyDone,
    /// Preconditions not met yet (e.g. no escrow locked); try again later.
    SkippedNotReady,
    /// The guard re-check flipped between decision and send. Benign race:
    /// the other actor (or the deadline) already resolved it. No retry.
    AbortedStale,
    /// Another handler holds the in-flight marker for this task.
    SkippedInFlight,
    /// Transient failure; the task returns to its previous state and a
    /// bounded backoff delays the next attempt.
    Deferred,
}

/// Per-task in-flight markers with exclusive check-then-set semantics.
///
/// Prevents two overlapping event deliveries from driving concurrent
/// reveal/settle attempts for the same task. Contention is low, so a single
/// critical section over a membership set is all this needs.
#[derive(Default)]
pub struct InFlightSet {
    inner: Mutex<HashSet<u64>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the marker for `task_id`, or `None` when a concurrent handler
    /// already holds it. The guard releases on drop.
    pub fn try_claim(&self, task_id: u64) -> Option<InFlightGuard<'_>> {
        let mut set = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if set.insert(task_id) {
            Some(InFlightGuard {
                set: &self.inner,
                task_id,
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<u64>>,
    task_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        set.remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_claim_is_exclusive_until_dropped() {
        let set = InFlightSet::new();
        let guard = set.try_claim(7).expect("first claim succeeds");
        assert!(set.try_claim(7).is_none());
        assert!(set.try_claim(8).is_some());
        drop(guard);
        assert!(set.try_claim(7).is_some());
    }
}
