//! Task wakers and loop parking.
//!
//! Waking a task records its id in the loop's woken set (deduplicated, in
//! wake order) and unparks the loop thread. The loop parks on a condvar when
//! nothing is woken, bounded by its next timer deadline.
//!
//! Note: This implementation uses safe Rust only (no unsafe).

use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::Instant;

use crate::types::TaskId;

/// Shared wake state of one event loop.
#[derive(Debug, Default)]
pub struct WakerState {
    woken: Mutex<Woken>,
    unpark: Condvar,
}

#[derive(Debug, Default)]
struct Woken {
    order: VecDeque<TaskId>,
    set: HashSet<TaskId>,
    notified: bool,
}

impl WakerState {
    /// Creates a new waker state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a waker for a specific task.
    #[must_use]
    pub fn waker_for(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            state: Arc::clone(self),
            task,
        }))
    }

    /// Drains all woken tasks in wake order.
    pub fn drain_woken(&self) -> Vec<TaskId> {
        let mut woken = self.woken.lock();
        woken.set.clear();
        woken.notified = false;
        woken.order.drain(..).collect()
    }

    /// Returns true if any tasks have been woken.
    #[must_use]
    pub fn has_woken(&self) -> bool {
        !self.woken.lock().order.is_empty()
    }

    /// Wakes the loop without naming a task (new work arrived).
    pub fn notify(&self) {
        let mut woken = self.woken.lock();
        woken.notified = true;
        self.unpark.notify_one();
    }

    /// Blocks until a task is woken, [`notify`](Self::notify) is called, or
    /// `deadline` passes.
    pub fn park(&self, deadline: Option<Instant>) {
        let mut woken = self.woken.lock();
        while woken.order.is_empty() && !woken.notified {
            match deadline {
                Some(deadline) => {
                    if self.unpark.wait_until(&mut woken, deadline).timed_out() {
                        break;
                    }
                }
                None => self.unpark.wait(&mut woken),
            }
        }
        woken.notified = false;
    }

    fn wake(&self, task: TaskId) {
        let mut woken = self.woken.lock();
        if woken.set.insert(task) {
            woken.order.push_back(task);
            self.unpark.notify_one();
        }
    }
}

struct TaskWaker {
    state: Arc<WakerState>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.state.wake(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.state.wake(self.task);
    }
}
