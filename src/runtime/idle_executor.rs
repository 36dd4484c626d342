//! An executor that runs work on a thread while it is blocked.
//!
//! A thread that blocks on an async result (an `async_to_sync` call) creates
//! an [`IdleExecutor`] and parks in [`IdleExecutor::run_until`]. Other
//! threads submit jobs to it; the blocked thread runs them, in submission
//! order, until the awaited slot resolves. This is what lets thread-sensitive
//! sync work nested under an async call come back to the thread that made
//! the call.
//!
//! Once `run_until` returns the executor is broken. Executors on one thread
//! form a chain through their predecessors; submissions to a broken executor
//! go to the nearest live predecessor, and work still queued when an
//! executor breaks is handed to that predecessor or, if there is none,
//! dropped.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::executor::{Executor, Job, Submission};
use super::slot::SlotProbe;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, trace};
use crate::types::ExecutorId;

/// A single-use executor owned by one blocked thread.
#[derive(Clone)]
pub struct IdleExecutor {
    inner: Arc<IdleInner>,
}

struct IdleInner {
    id: ExecutorId,
    owner: ThreadId,
    state: Mutex<IdleState>,
    work_ready: Condvar,
    predecessor: Option<IdleExecutor>,
}

#[derive(Default)]
struct IdleState {
    queue: VecDeque<Job>,
    broken: bool,
    running: bool,
}

impl IdleExecutor {
    /// Creates an executor owned by the calling thread.
    ///
    /// `predecessor` is the executor of the enclosing blocked call, if any.
    #[must_use]
    pub fn new(predecessor: Option<Self>) -> Self {
        Self {
            inner: Arc::new(IdleInner {
                id: ExecutorId::next(),
                owner: thread::current().id(),
                state: Mutex::new(IdleState::default()),
                work_ready: Condvar::new(),
                predecessor,
            }),
        }
    }

    /// Returns the executor's id.
    #[must_use]
    pub fn id(&self) -> ExecutorId {
        self.inner.id
    }

    /// Returns the id of the owning thread.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.inner.owner
    }

    /// Returns `true` once [`run_until`](Self::run_until) has returned.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.inner.state.lock().broken
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queues `job` on the nearest live executor of the chain.
    ///
    /// Hands the job back if every executor in the chain is broken.
    pub(crate) fn try_submit(&self, job: Job) -> std::result::Result<Submission, Job> {
        let submission = job.submission();
        let mut current = Some(self);
        while let Some(executor) = current {
            {
                let mut state = executor.inner.state.lock();
                if !state.broken {
                    state.queue.push_back(job);
                    executor.inner.work_ready.notify_one();
                    trace!(executor = %executor.inner.id, "job queued on idle executor");
                    return Ok(submission);
                }
            }
            current = executor.inner.predecessor.as_ref();
        }
        Err(job)
    }

    /// Runs queued jobs on the owning thread until `target` resolves.
    ///
    /// Fails with [`ErrorKind::Usage`] off the owning thread and with
    /// [`ErrorKind::ExecutorBroken`] if the executor already ran.
    pub fn run_until(&self, target: &dyn SlotProbe) -> Result<()> {
        if thread::current().id() != self.inner.owner {
            return Err(Error::usage(
                "an idle executor can only be run by the thread that created it",
            ));
        }
        {
            let mut state = self.inner.state.lock();
            if state.broken || state.running {
                return Err(Error::new(ErrorKind::ExecutorBroken)
                    .with_message(format!("{} has already run", self.inner.id)));
            }
            state.running = true;
        }

        let notify = Arc::clone(&self.inner);
        target.on_resolved_boxed(Box::new(move || {
            let _state = notify.state.lock();
            notify.work_ready.notify_all();
        }));

        let _exit = BreakOnExit { inner: &self.inner };
        let mut ran = 0_usize;
        loop {
            let job = {
                let mut state = self.inner.state.lock();
                loop {
                    if target.is_resolved() {
                        break None;
                    }
                    if let Some(job) = state.queue.pop_front() {
                        break Some(job);
                    }
                    self.inner.work_ready.wait(&mut state);
                }
            };
            match job {
                Some(job) => {
                    if job.run() {
                        ran += 1;
                    }
                }
                None => break,
            }
        }
        trace!(executor = %self.inner.id, ran, "idle executor finished");
        Ok(())
    }
}

/// Marks the executor broken and re-homes its leftover work, also when a
/// job unwinds out of `run_until`.
struct BreakOnExit<'a> {
    inner: &'a IdleInner,
}

impl Drop for BreakOnExit<'_> {
    fn drop(&mut self) {
        let mut leftovers = {
            let mut state = self.inner.state.lock();
            state.broken = true;
            state.running = false;
            std::mem::take(&mut state.queue)
        };
        if leftovers.is_empty() {
            return;
        }
        let mut next = self.inner.predecessor.as_ref();
        while let Some(executor) = next {
            let mut state = executor.inner.state.lock();
            if !state.broken {
                debug!(
                    from = %self.inner.id,
                    to = %executor.inner.id,
                    jobs = leftovers.len(),
                    "handing leftover work to predecessor"
                );
                state.queue.append(&mut leftovers);
                executor.inner.work_ready.notify_one();
                return;
            }
            drop(state);
            next = executor.inner.predecessor.as_ref();
        }
        debug!(
            executor = %self.inner.id,
            jobs = leftovers.len(),
            "abandoning leftover work"
        );
        drop(leftovers);
    }
}

impl Executor for IdleExecutor {
    fn submit(&self, job: Job) -> Result<Submission> {
        if thread::current().id() == self.inner.owner {
            return Err(Error::usage(
                "cannot submit to an idle executor from its own thread",
            ));
        }
        self.try_submit(job).map_err(|_job| {
            Error::new(ErrorKind::ExecutorBroken)
                .with_message(format!("{} and its predecessors have quit", self.inner.id))
        })
    }
}

impl fmt::Debug for IdleExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IdleExecutor")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("queued", &state.queue.len())
            .field("broken", &state.broken)
            .field(
                "predecessor",
                &self.inner.predecessor.as_ref().map(|p| p.inner.id),
            )
            .finish()
    }
}
