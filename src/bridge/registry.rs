//! Thread and task affinity tracking.
//!
//! The registry answers three questions from anywhere in a call stack:
//!
//! - a sync callee asks which loop (and which awaiting task) launched the
//!   thread it runs on, so `async_to_sync` can schedule back onto that loop
//! - diagnostics ask which thread launched a given task
//! - `sync_to_async` asks whether a loop already has a blocked thread idling
//!   for it
//!
//! Every entry is owned by a guard created when a crossing starts and
//! removed by the guard's `Drop`, so no entry outlives its crossing, even
//! when the crossing unwinds. Locks are held only for the map update.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

use super::pending::NestedTasks;
use crate::runtime::{IdleExecutor, LoopHandle};
use crate::types::{LoopId, TaskId};

/// Where a sync callee came from.
#[derive(Clone)]
pub struct LaunchRecord {
    /// The loop the awaiting caller runs on.
    pub loop_handle: LoopHandle,
    /// The awaiting task.
    pub task: Option<TaskId>,
    /// Process that recorded the entry; a forked child sees its parent's id.
    pub process_id: u32,
    pub(crate) nested: NestedTasks,
}

impl fmt::Debug for LaunchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRecord")
            .field("loop_id", &self.loop_handle.id())
            .field("task", &self.task)
            .field("process_id", &self.process_id)
            .field("nested", &self.nested.len())
            .finish()
    }
}

/// Entry counts, for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Threads with at least one launch record.
    pub threads: usize,
    /// Tasks with a recorded launching thread.
    pub tasks: usize,
    /// Loops with a registered idle executor.
    pub loops: usize,
}

/// Process-wide affinity maps of one [`Bridge`](super::Bridge).
#[derive(Default)]
pub struct AffinityRegistry {
    launches: RwLock<HashMap<ThreadId, Vec<LaunchRecord>>>,
    task_threads: RwLock<HashMap<TaskId, ThreadId>>,
    loop_executors: RwLock<HashMap<LoopId, IdleExecutor>>,
}

impl AffinityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the current thread runs a callee for `record`'s loop.
    ///
    /// Records stack: a thread that idles on behalf of a nested call pushes
    /// a second record on top of its own.
    pub(crate) fn enter_thread(&self, record: LaunchRecord) -> ThreadEntry<'_> {
        let thread = thread::current().id();
        self.launches.write().entry(thread).or_default().push(record);
        ThreadEntry {
            registry: self,
            thread,
        }
    }

    /// The innermost launch record of the current thread.
    #[must_use]
    pub fn launch_record(&self) -> Option<LaunchRecord> {
        self.launches
            .read()
            .get(&thread::current().id())
            .and_then(|records| records.last().cloned())
    }

    /// The task that launched the callee running on `thread`, if any.
    #[must_use]
    pub fn launching_task(&self, thread: ThreadId) -> Option<TaskId> {
        self.launches
            .read()
            .get(&thread)
            .and_then(|records| records.last())
            .and_then(|record| record.task)
    }

    /// Records that `task` was launched by `thread`.
    pub(crate) fn enter_task(&self, task: TaskId, thread: ThreadId) -> TaskEntry<'_> {
        self.task_threads.write().insert(task, thread);
        TaskEntry {
            registry: self,
            task,
        }
    }

    /// The thread that launched `task`, while its crossing is in flight.
    #[must_use]
    pub fn launching_thread(&self, task: TaskId) -> Option<ThreadId> {
        self.task_threads.read().get(&task).copied()
    }

    /// Registers the executor idling for a private loop.
    pub(crate) fn enter_loop(&self, loop_id: LoopId, executor: IdleExecutor) -> LoopEntry<'_> {
        self.loop_executors.write().insert(loop_id, executor);
        LoopEntry {
            registry: self,
            loop_id,
        }
    }

    /// The executor idling for `loop_id`, if any.
    #[must_use]
    pub fn loop_executor(&self, loop_id: LoopId) -> Option<IdleExecutor> {
        self.loop_executors.read().get(&loop_id).cloned()
    }

    /// Current entry counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            threads: self.launches.read().len(),
            tasks: self.task_threads.read().len(),
            loops: self.loop_executors.read().len(),
        }
    }
}

impl fmt::Debug for AffinityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffinityRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pops a thread's launch record on drop.
#[must_use = "the entry is removed when the guard drops"]
pub(crate) struct ThreadEntry<'a> {
    registry: &'a AffinityRegistry,
    thread: ThreadId,
}

impl Drop for ThreadEntry<'_> {
    fn drop(&mut self) {
        let popped = {
            let mut launches = self.registry.launches.write();
            let popped = launches.get_mut(&self.thread).and_then(Vec::pop);
            if launches.get(&self.thread).is_some_and(Vec::is_empty) {
                launches.remove(&self.thread);
            }
            popped
        };
        drop(popped);
    }
}

/// Removes a task's launching thread on drop.
#[must_use = "the entry is removed when the guard drops"]
pub(crate) struct TaskEntry<'a> {
    registry: &'a AffinityRegistry,
    task: TaskId,
}

impl Drop for TaskEntry<'_> {
    fn drop(&mut self) {
        self.registry.task_threads.write().remove(&self.task);
    }
}

/// Removes a loop's idle executor on drop.
#[must_use = "the entry is removed when the guard drops"]
pub(crate) struct LoopEntry<'a> {
    registry: &'a AffinityRegistry,
    loop_id: LoopId,
}

impl Drop for LoopEntry<'_> {
    fn drop(&mut self) {
        let removed = self.registry.loop_executors.write().remove(&self.loop_id);
        drop(removed);
    }
}
