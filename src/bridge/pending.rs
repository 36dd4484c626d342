//! Bookkeeping for calls in flight across the bridge.
//!
//! - [`JobCompletion`] resolves a call's slot exactly once, even when the job
//!   carrying it is dropped unrun (withdrawn, or abandoned by an idle
//!   executor)
//! - [`NestedTasks`] lists the async tasks a sync callee launched through
//!   `async_to_sync`, so a cancelled `sync_to_async` caller can cancel the
//!   task its callee is blocked on

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::runtime::{CancelToken, ResultSlot, SlotProbe};
use crate::types::{CancelReason, Outcome, TaskId};

/// Completes a slot once; completes it as abandoned when dropped unused.
pub(crate) struct JobCompletion<T> {
    slot: Option<Arc<ResultSlot<T>>>,
}

impl<T> JobCompletion<T> {
    pub(crate) fn new(slot: Arc<ResultSlot<T>>) -> Self {
        Self { slot: Some(slot) }
    }

    pub(crate) fn complete(mut self, outcome: Outcome<T>) -> bool {
        self.slot
            .take()
            .is_some_and(|slot| slot.complete(outcome))
    }
}

impl<T> Drop for JobCompletion<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.cancel(CancelReason::abandoned());
        }
    }
}

/// A cancellable async task launched from a sync callee.
#[derive(Clone)]
pub(crate) struct NestedTask {
    pub(crate) id: TaskId,
    pub(crate) token: CancelToken,
    pub(crate) probe: Arc<dyn SlotProbe>,
}

impl fmt::Debug for NestedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedTask")
            .field("id", &self.id)
            .field("resolved", &self.probe.is_resolved())
            .finish()
    }
}

/// The nested tasks of one `sync_to_async` crossing, oldest first.
#[derive(Clone, Default)]
pub(crate) struct NestedTasks {
    inner: Arc<Mutex<Vec<NestedTask>>>,
}

impl NestedTasks {
    /// Records `task` until the returned guard drops.
    pub(crate) fn register(&self, task: NestedTask) -> NestedTaskGuard {
        let id = task.id;
        self.inner.lock().push(task);
        NestedTaskGuard {
            tasks: self.clone(),
            id,
        }
    }

    /// The oldest task still registered.
    pub(crate) fn first(&self) -> Option<NestedTask> {
        self.inner.lock().first().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl fmt::Debug for NestedTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.lock().iter()).finish()
    }
}

/// Removes a task from its [`NestedTasks`] on drop.
pub(crate) struct NestedTaskGuard {
    tasks: NestedTasks,
    id: TaskId,
}

impl Drop for NestedTaskGuard {
    fn drop(&mut self) {
        let removed = {
            let mut tasks = self.tasks.inner.lock();
            tasks
                .iter()
                .position(|task| task.id == self.id)
                .map(|index| tasks.remove(index))
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelKind;

    #[test]
    fn dropped_completion_abandons_slot() {
        let slot: Arc<ResultSlot<u8>> = ResultSlot::shared();
        drop(JobCompletion::new(Arc::clone(&slot)));
        match slot.take() {
            Some(Outcome::Cancelled(reason)) => assert_eq!(reason.kind, CancelKind::Abandoned),
            other => unreachable!("expected abandoned cancellation, got {other:?}"),
        }
    }

    #[test]
    fn completion_wins_over_later_drop() {
        let slot: Arc<ResultSlot<u8>> = ResultSlot::shared();
        assert!(JobCompletion::new(Arc::clone(&slot)).complete(Outcome::Ok(5)));
        crate::assert_outcome_ok!(slot.take().unwrap(), 5);
    }

    #[test]
    fn guards_unregister_their_own_task() {
        let tasks = NestedTasks::default();
        let probe: Arc<dyn SlotProbe> = ResultSlot::<()>::shared();
        let task = |n| NestedTask {
            id: TaskId::new_for_test(n),
            token: CancelToken::new(),
            probe: Arc::clone(&probe),
        };
        let first = tasks.register(task(1));
        let second = tasks.register(task(2));
        assert_eq!(tasks.first().map(|t| t.id), Some(TaskId::new_for_test(1)));
        drop(first);
        assert_eq!(tasks.first().map(|t| t.id), Some(TaskId::new_for_test(2)));
        drop(second);
        assert_eq!(tasks.len(), 0);
    }
}
