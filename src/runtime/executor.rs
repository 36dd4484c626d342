//! The executor seam shared by worker pools and idle executors.
//!
//! A [`Job`] is a boxed closure paired with a [`Submission`] that tracks
//! whether it is still queued. Queued jobs can be withdrawn; a withdrawn job
//! is skipped (and dropped) when an executor dequeues it. Dropping a job
//! without running it drops its closure, so anything the closure owns is
//! released on the executor's thread.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Result;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const WITHDRAWN: u8 = 2;

/// Shared view of a job's lifecycle.
#[derive(Clone)]
pub struct Submission {
    state: Arc<AtomicU8>,
}

impl Submission {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Withdraws the job if it has not started.
    ///
    /// Returns `true` when the job will never run.
    pub fn withdraw(&self) -> bool {
        self.state
            .compare_exchange(PENDING, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` once an executor has started the job.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Returns `true` if the job was withdrawn before it started.
    #[must_use]
    pub fn is_withdrawn(&self) -> bool {
        self.state.load(Ordering::Acquire) == WITHDRAWN
    }

    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            RUNNING => "running",
            _ => "withdrawn",
        };
        f.debug_struct("Submission").field("state", &state).finish()
    }
}

/// A unit of work handed to an [`Executor`].
pub struct Job {
    work: Box<dyn FnOnce() + Send + 'static>,
    submission: Submission,
}

impl Job {
    /// Wraps a closure as a job.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Box::new(f),
            submission: Submission::new(),
        }
    }

    /// Returns the job's submission handle.
    #[must_use]
    pub fn submission(&self) -> Submission {
        self.submission.clone()
    }

    /// Runs the job unless it was withdrawn.
    ///
    /// Returns `true` if the closure ran.
    pub fn run(self) -> bool {
        if self.submission.try_start() {
            (self.work)();
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("submission", &self.submission)
            .finish_non_exhaustive()
    }
}

/// Something that runs jobs on some thread.
pub trait Executor: Send + Sync {
    /// Queues a job for execution.
    fn submit(&self, job: Job) -> Result<Submission>;
}
