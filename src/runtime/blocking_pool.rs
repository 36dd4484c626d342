//! Worker pools for sync callables.
//!
//! A [`BlockingPool`] owns a set of OS threads that pull [`Job`]s from a
//! lock-free FIFO queue. The bridge uses three shapes of pool:
//!
//! - the **single-thread slot**: exactly one worker, shared by every
//!   thread-sensitive call that has no better home
//! - one **scope pool** per open thread-sensitivity scope, also one worker
//! - the **default pool** for non-thread-sensitive calls
//!
//! Threads are spawned lazily up to `max_threads`. Workers above
//! `min_threads` retire after `idle_timeout` without work.
//!
//! Jobs cannot be interrupted once started. A queued job can be withdrawn
//! through its [`Submission`](super::executor::Submission); the worker then
//! drops it unrun.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::{Duration, Instant};

use super::executor::{Executor, Job, Submission};
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, trace};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    // Address of the pool the current thread works for, 0 if none.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// A handle to a blocking pool that can be cloned and shared.
///
/// Handles do not keep the workers alive past [`BlockingPool::shutdown`].
#[derive(Clone)]
pub struct BlockingPoolHandle {
    inner: Arc<BlockingPoolInner>,
}

impl fmt::Debug for BlockingPoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPoolHandle")
            .field("name", &self.inner.thread_name_prefix)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "pending_jobs",
                &self.inner.pending_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Owner of a set of worker threads.
///
/// Dropping the pool initiates shutdown; queued jobs still run and the
/// workers exit once the queue is empty.
pub struct BlockingPool {
    inner: Arc<BlockingPoolInner>,
}

impl fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPool")
            .field("name", &self.inner.thread_name_prefix)
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "pending_jobs",
                &self.inner.pending_count.load(Ordering::Relaxed),
            )
            .field("thread_handles", &self.inner.thread_handles.lock().len())
            .finish()
    }
}

struct BlockingPoolInner {
    min_threads: usize,
    max_threads: usize,
    active_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    pending_count: AtomicUsize,
    spawned_total: AtomicUsize,
    queue: SegQueue<Job>,
    shutdown: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
    idle_timeout: Duration,
    thread_name_prefix: String,
    thread_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

/// Configuration options for a blocking pool.
#[derive(Debug, Clone)]
pub struct BlockingPoolOptions {
    /// Idle timeout before retiring threads above the minimum.
    pub idle_timeout: Duration,
    /// Thread name prefix; workers are named `{prefix}-{n}`.
    pub thread_name_prefix: String,
}

impl Default for BlockingPoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "syncbridge-worker".to_string(),
        }
    }
}

impl BlockingPool {
    /// Creates a new pool with the specified thread limits.
    ///
    /// `max_threads` is raised to at least 1 and to at least `min_threads`.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self::with_options(min_threads, max_threads, BlockingPoolOptions::default())
    }

    /// Creates a pool of exactly one worker, kept for the pool's lifetime.
    #[must_use]
    pub fn single_thread(options: BlockingPoolOptions) -> Self {
        Self::with_options(1, 1, options)
    }

    /// Creates a new pool with custom options.
    #[must_use]
    pub fn with_options(
        min_threads: usize,
        max_threads: usize,
        options: BlockingPoolOptions,
    ) -> Self {
        let max_threads = max_threads.max(1).max(min_threads);
        let inner = Arc::new(BlockingPoolInner {
            min_threads,
            max_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            spawned_total: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
            thread_handles: Mutex::new(Vec::with_capacity(max_threads)),
        });

        for _ in 0..min_threads {
            if let Err(err) = spawn_thread_on_inner(&inner) {
                debug!(error = %err, "eager worker spawn failed");
            }
        }

        Self { inner }
    }

    /// Returns a cloneable handle to this pool.
    #[must_use]
    pub fn handle(&self) -> BlockingPoolHandle {
        BlockingPoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Queues a job.
    pub fn submit(&self, job: Job) -> Result<Submission> {
        submit_on_inner(&self.inner, job)
    }

    /// Returns the number of queued jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of workers currently running a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown of the pool.
    ///
    /// No new jobs are accepted. Queued jobs still run.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        notify_all(&self.inner);
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `true` if all workers exited within `timeout`. Calling this
    /// from one of the pool's own workers only initiates shutdown.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        if self.inner.is_current_worker() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        {
            let mut guard = self.inner.mutex.lock();
            while self.inner.active_threads.load(Ordering::Acquire) > 0 {
                if self
                    .inner
                    .condvar
                    .wait_until(&mut guard, deadline)
                    .timed_out()
                {
                    return self.inner.active_threads.load(Ordering::Acquire) == 0;
                }
            }
        }

        let handles: Vec<_> = self.inner.thread_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Executor for BlockingPool {
    fn submit(&self, job: Job) -> Result<Submission> {
        submit_on_inner(&self.inner, job)
    }
}

impl BlockingPoolHandle {
    /// Queues a job.
    pub fn submit(&self, job: Job) -> Result<Submission> {
        submit_on_inner(&self.inner, job)
    }

    /// Returns the number of queued jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Returns `true` if the calling thread is one of this pool's workers.
    #[must_use]
    pub fn is_current_worker(&self) -> bool {
        self.inner.is_current_worker()
    }
}

impl Executor for BlockingPoolHandle {
    fn submit(&self, job: Job) -> Result<Submission> {
        submit_on_inner(&self.inner, job)
    }
}

impl BlockingPoolInner {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn is_current_worker(self: &Arc<Self>) -> bool {
        CURRENT_POOL.with(Cell::get) == self.key()
    }
}

fn submit_on_inner(inner: &Arc<BlockingPoolInner>, job: Job) -> Result<Submission> {
    if inner.shutdown.load(Ordering::Acquire) {
        return Err(Error::new(ErrorKind::ExecutorBroken)
            .with_message(format!("pool {} is shut down", inner.thread_name_prefix)));
    }
    let submission = job.submission();
    inner.queue.push(job);
    inner.pending_count.fetch_add(1, Ordering::Relaxed);
    // Under the mutex so a worker cannot retire between our push and the
    // spawn decision.
    let _guard = inner.mutex.lock();
    maybe_spawn_thread_on_inner(inner)?;
    inner.condvar.notify_one();
    Ok(submission)
}

fn notify_all(inner: &BlockingPoolInner) {
    let _guard = inner.mutex.lock();
    inner.condvar.notify_all();
}

fn spawn_thread_on_inner(inner: &Arc<BlockingPoolInner>) -> Result<()> {
    let inner_clone = Arc::clone(inner);
    let n = inner.spawned_total.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{n}", inner.thread_name_prefix);
    inner.active_threads.fetch_add(1, Ordering::AcqRel);

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        CURRENT_POOL.with(|c| c.set(inner_clone.key()));
        trace!(thread = %name, "pool worker started");
        blocking_worker_loop(&inner_clone);
        trace!(thread = %name, "pool worker stopped");
    });

    match spawned {
        Ok(handle) => {
            inner.thread_handles.lock().push(handle);
            Ok(())
        }
        Err(err) => {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            Err(Error::internal(format!("failed to spawn pool worker: {err}")))
        }
    }
}

fn maybe_spawn_thread_on_inner(inner: &Arc<BlockingPoolInner>) -> Result<()> {
    let active = inner.active_threads.load(Ordering::Acquire);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.pending_count.load(Ordering::Relaxed);

    if active < inner.max_threads && (active == 0 || (busy >= active && pending > 0)) {
        spawn_thread_on_inner(inner)?;
    }
    Ok(())
}

fn blocking_worker_loop(inner: &BlockingPoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            job.run();
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        let mut guard = inner.mutex.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            retire_locked(inner);
            return;
        }

        let active = inner.active_threads.load(Ordering::Relaxed);
        if active > inner.min_threads {
            let timed_out = inner
                .condvar
                .wait_for(&mut guard, inner.idle_timeout)
                .timed_out();
            if timed_out
                && inner.queue.is_empty()
                && inner.active_threads.load(Ordering::Relaxed) > inner.min_threads
            {
                retire_locked(inner);
                return;
            }
        } else {
            inner.condvar.wait(&mut guard);
        }
    }
}

// Caller holds `inner.mutex`.
fn retire_locked(inner: &BlockingPoolInner) {
    inner.active_threads.fetch_sub(1, Ordering::AcqRel);
    inner.condvar.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;

    fn options(prefix: &str) -> BlockingPoolOptions {
        BlockingPoolOptions {
            idle_timeout: Duration::from_millis(50),
            thread_name_prefix: prefix.to_string(),
        }
    }

    #[test]
    fn runs_submitted_jobs() {
        let pool = BlockingPool::new(1, 4);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.submit(Job::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut got: Vec<i32> = (0..20).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn single_thread_slot_reuses_one_thread() {
        let pool = BlockingPool::single_thread(options("slot-test"));
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            pool.submit(Job::new(move || {
                tx.send((thread::current().id(), thread::current().name().map(String::from)))
                    .unwrap();
            }))
            .unwrap();
            // Longer than the idle timeout between jobs.
            thread::sleep(Duration::from_millis(60));
        }
        let seen: Vec<_> = (0..10).map(|_| rx.recv().unwrap()).collect();
        let ids: HashSet<_> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(seen[0].1.as_deref(), Some("slot-test-0"));
    }

    #[test]
    fn single_thread_slot_is_fifo() {
        let pool = BlockingPool::single_thread(options("fifo"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            pool.submit(Job::new(move || {
                order.lock().push(i);
                if i == 49 {
                    tx.send(()).unwrap();
                }
            }))
            .unwrap();
        }
        rx.recv().unwrap();
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn withdrawn_job_never_runs() {
        let pool = BlockingPool::single_thread(options("withdraw"));
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (ran_tx, ran_rx) = mpsc::channel::<&'static str>();

        let first_tx = ran_tx.clone();
        pool.submit(Job::new(move || {
            block_rx.recv().unwrap();
            first_tx.send("first").unwrap();
        }))
        .unwrap();
        let second = pool
            .submit(Job::new(move || ran_tx.send("second").unwrap()))
            .unwrap();

        assert!(second.withdraw());
        block_tx.send(()).unwrap();
        assert_eq!(ran_rx.recv().unwrap(), "first");
        assert!(ran_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = BlockingPool::new(0, 2);
        pool.shutdown();
        let err = pool.submit(Job::new(|| {})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutorBroken);
    }

    #[test]
    fn shutdown_and_wait_joins_workers() {
        let pool = BlockingPool::new(2, 4);
        let start = Instant::now();
        assert!(pool.shutdown_and_wait(Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn shutdown_and_wait_times_out_on_busy_worker() {
        let pool = BlockingPool::new(1, 1);
        pool.submit(Job::new(|| thread::sleep(Duration::from_millis(500))))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!pool.shutdown_and_wait(Duration::from_millis(50)));
    }

    #[test]
    fn excess_workers_retire() {
        let pool = BlockingPool::with_options(0, 4, options("retire"));
        let (tx, rx) = mpsc::channel();
        pool.submit(Job::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.active_threads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn worker_knows_its_pool() {
        let pool = BlockingPool::new(0, 1);
        let handle = pool.handle();
        let (tx, rx) = mpsc::channel();
        let probe = handle.clone();
        handle
            .submit(Job::new(move || tx.send(probe.is_current_worker()).unwrap()))
            .unwrap();
        assert!(rx.recv().unwrap());
        assert!(!handle.is_current_worker());
    }
}
