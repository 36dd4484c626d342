//! A single-threaded cooperative event loop.
//!
//! [`EventLoop::run`] drives a root future on the calling thread together
//! with any tasks spawned onto the loop through a [`LoopHandle`], from this
//! thread or any other. The loop returns once the root future completes and
//! every remaining task has finished.
//!
//! # Cancellation
//!
//! Each spawned task owns a [`CancelToken`]. Cancelling it wakes the task; if
//! the next poll returns `Pending` and nothing holds a drain guard on the
//! token, the task's future is dropped and its [`JoinHandle`] resolves to a
//! `Cancelled` error. A task cancelled before its first poll never runs.
//!
//! When the root future completes the loop closes: further spawns fail with
//! `LoopClosed` and all outstanding tasks are cancelled with
//! [`CancelKind::Shutdown`](crate::types::CancelKind::Shutdown).
//!
//! # Context
//!
//! Every task runs inside its own context frame, so [`Local`](crate::Local)
//! values set by one task are invisible to its siblings. A spawned task
//! starts from a copy of the spawner's context.

use futures_lite::FutureExt;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::slot::{ResultSlot, SlotProbe};
use super::timer::TimerHeap;
use super::waker::WakerState;
use crate::error::{Error, ErrorKind, Result};
use crate::local::context::{self, ContextSnapshot, Frame, PinnedMap};
use crate::tracing_compat::{debug, debug_span, trace};
use crate::types::{CancelReason, LoopId, Outcome, PanicPayload, TaskId};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<(TaskId, CancelToken)>> = const { RefCell::new(None) };
}

/// Returns a handle to the loop running on the current thread.
///
/// Fails with [`ErrorKind::NoRunningLoop`] when called outside a loop.
pub fn current_loop() -> Result<LoopHandle> {
    CURRENT_LOOP
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
        .ok_or_else(|| {
            Error::new(ErrorKind::NoRunningLoop).with_message("no event loop running on this thread")
        })
}

/// Returns the id of the task currently being polled on this thread.
#[must_use]
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK
        .try_with(|current| current.borrow().as_ref().map(|(id, _)| *id))
        .ok()
        .flatten()
}

/// Returns `true` if an event loop is running on this thread.
#[must_use]
pub fn is_loop_thread() -> bool {
    CURRENT_LOOP
        .try_with(|current| current.borrow().is_some())
        .unwrap_or(false)
}

pub(crate) fn current_cancel_token() -> Option<CancelToken> {
    CURRENT_TASK
        .try_with(|current| current.borrow().as_ref().map(|(_, token)| token.clone()))
        .ok()
        .flatten()
}

struct LoopGuard;

impl LoopGuard {
    fn enter(handle: LoopHandle) -> Self {
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(handle));
        Self
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let previous = CURRENT_LOOP.try_with(|current| current.borrow_mut().take());
        drop(previous);
    }
}

struct TaskGuard {
    previous: Option<(TaskId, CancelToken)>,
}

impl TaskGuard {
    fn enter(id: TaskId, token: CancelToken) -> Self {
        let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace((id, token)));
        Self { previous }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_TASK.try_with(|current| *current.borrow_mut() = previous);
    }
}

struct LoopShared {
    id: LoopId,
    wake: Arc<WakerState>,
    incoming: Mutex<Incoming>,
    timers: Mutex<TimerHeap>,
}

#[derive(Default)]
struct Incoming {
    tasks: Vec<Task>,
    closed: bool,
}

/// A spawned unit of work.
pub(crate) struct Task {
    id: TaskId,
    future: BoxFuture,
    token: CancelToken,
    frame: Arc<Frame>,
}

impl Task {
    /// Wraps `future` so its outcome lands in the returned handle's slot.
    ///
    /// A panic inside `future` is caught and recorded; dropping the task
    /// before it finishes records a cancellation.
    pub(crate) fn new<F>(future: F, frame: Arc<Frame>) -> (Self, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = TaskId::next();
        let token = CancelToken::new();
        let slot = ResultSlot::shared();
        let completion = Completion {
            slot: Some(Arc::clone(&slot)),
            token: token.clone(),
        };
        let future: BoxFuture = Box::pin(async move {
            let completion = completion;
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(value) => Outcome::Ok(value),
                Err(payload) => Outcome::Panicked(PanicPayload::new(payload)),
            };
            completion.complete(outcome);
        });
        let handle = JoinHandle {
            id,
            slot,
            token: token.clone(),
        };
        (
            Self {
                id,
                future,
                token,
                frame,
            },
            handle,
        )
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Drops the future inside the task's own frame.
    pub(crate) fn discard(self) {
        let Self { future, frame, .. } = self;
        let _frame = context::enter(frame);
        drop(future);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Resolves a task's slot, as cancelled if dropped before completion.
struct Completion<T> {
    slot: Option<Arc<ResultSlot<T>>>,
    token: CancelToken,
}

impl<T> Completion<T> {
    fn complete(mut self, outcome: Outcome<T>) {
        if let Some(slot) = self.slot.take() {
            slot.complete(outcome);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let reason = self.token.reason().unwrap_or_else(CancelReason::shutdown);
            slot.cancel(reason);
        }
    }
}

/// A single-threaded event loop.
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Creates a loop that is not yet running.
    ///
    /// Tasks spawned through its [`handle`](Self::handle) before
    /// [`run`](Self::run) are queued and start when the loop does.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                id: LoopId::next(),
                wake: Arc::new(WakerState::new()),
                incoming: Mutex::new(Incoming::default()),
                timers: Mutex::new(TimerHeap::new()),
            }),
        }
    }

    /// Returns the loop's id.
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Returns a handle for spawning onto this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `root` to completion on the current thread, then drains the
    /// remaining tasks.
    ///
    /// Fails with [`ErrorKind::Usage`] if a loop is already running on this
    /// thread.
    pub fn run<F: Future>(self, root: F) -> Result<F::Output> {
        if is_loop_thread() {
            return Err(Error::usage(
                "cannot start an event loop on a thread that is already running one",
            ));
        }
        let _loop = LoopGuard::enter(self.handle());
        let span = debug_span!("event_loop", loop_id = %self.shared.id);
        let _span = span.enter();
        debug!("event loop started");
        let output = Runner {
            shared: &self.shared,
            tasks: HashMap::new(),
        }
        .run(root);
        debug!("event loop finished");
        Ok(output)
    }

    /// Runs `root` on a fresh loop on the current thread.
    pub fn block_on<F: Future>(root: F) -> Result<F::Output> {
        Self::new().run(root)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.shared.id)
            .finish()
    }
}

struct RunningTask {
    task: Task,
    waker: Waker,
    started: bool,
}

struct Runner<'a> {
    shared: &'a LoopShared,
    tasks: HashMap<TaskId, RunningTask>,
}

impl Runner<'_> {
    fn run<F: Future>(&mut self, root: F) -> F::Output {
        let root_id = TaskId::next();
        let root_token = CancelToken::new();
        let root_frame = Frame::pinned(context::capture(), PinnedMap::new());
        let root_waker = self.shared.wake.waker_for(root_id);
        let mut root = std::pin::pin!(root);
        let mut output = None;
        let mut closed = false;
        let mut ready = vec![root_id];

        loop {
            ready.extend(self.adopt_incoming());
            for id in ready.drain(..) {
                if id != root_id {
                    self.poll_task(id);
                } else if output.is_none() {
                    let _frame = context::enter(Arc::clone(&root_frame));
                    let _task = TaskGuard::enter(root_id, root_token.clone());
                    let mut cx = Context::from_waker(&root_waker);
                    if let Poll::Ready(value) = root.as_mut().poll(&mut cx) {
                        output = Some(value);
                    }
                }
            }

            if output.is_some() {
                if !closed {
                    closed = true;
                    ready.extend(self.close());
                    continue;
                }
                if self.tasks.is_empty() {
                    break;
                }
            }

            self.fire_timers();
            ready = self.shared.wake.drain_woken();
            if ready.is_empty() && !self.has_incoming() {
                let deadline = self.shared.timers.lock().peek_deadline();
                self.shared.wake.park(deadline);
                self.fire_timers();
                ready = self.shared.wake.drain_woken();
            }
        }

        match output {
            Some(value) => value,
            None => unreachable!("loop exits only after the root completes"),
        }
    }

    fn has_incoming(&self) -> bool {
        !self.shared.incoming.lock().tasks.is_empty()
    }

    fn adopt_incoming(&mut self) -> Vec<TaskId> {
        let fresh = std::mem::take(&mut self.shared.incoming.lock().tasks);
        self.adopt(fresh)
    }

    fn adopt(&mut self, fresh: Vec<Task>) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(fresh.len());
        for task in fresh {
            let waker = self.shared.wake.waker_for(task.id);
            task.token.register(&waker);
            trace!(task_id = %task.id, "task adopted");
            ids.push(task.id);
            self.tasks.insert(
                task.id,
                RunningTask {
                    task,
                    waker,
                    started: false,
                },
            );
        }
        ids
    }

    fn close(&mut self) -> Vec<TaskId> {
        let late = {
            let mut incoming = self.shared.incoming.lock();
            incoming.closed = true;
            std::mem::take(&mut incoming.tasks)
        };
        let ids = self.adopt(late);
        if !self.tasks.is_empty() {
            debug!(remaining = self.tasks.len(), "root finished, cancelling remaining tasks");
        }
        for running in self.tasks.values() {
            running.task.token.cancel(CancelReason::shutdown());
        }
        ids
    }

    fn poll_task(&mut self, id: TaskId) {
        let Some(running) = self.tasks.get_mut(&id) else {
            return;
        };
        let cancelled_before = running.task.token.is_cancelled();
        let done = if !running.started && cancelled_before {
            trace!(task_id = %id, "task cancelled before first poll");
            true
        } else {
            running.started = true;
            let _frame = context::enter(Arc::clone(&running.task.frame));
            let _task = TaskGuard::enter(id, running.task.token.clone());
            let mut cx = Context::from_waker(&running.waker);
            match running.task.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => true,
                Poll::Pending => cancelled_before && !running.task.token.is_draining(),
            }
        };
        if done {
            if let Some(running) = self.tasks.remove(&id) {
                running.task.discard();
            }
        }
    }

    fn fire_timers(&self) {
        let expired = self.shared.timers.lock().pop_expired(Instant::now());
        for waker in expired {
            waker.wake();
        }
    }
}

impl Drop for Runner<'_> {
    fn drop(&mut self) {
        // Only reached with tasks left when the root panicked.
        let late = {
            let mut incoming = self.shared.incoming.lock();
            incoming.closed = true;
            std::mem::take(&mut incoming.tasks)
        };
        for task in late {
            task.discard();
        }
        for (_, running) in self.tasks.drain() {
            running.task.discard();
        }
        self.shared.timers.lock().clear();
    }
}

/// A cloneable handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Returns the loop's id.
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Returns `true` once the loop has stopped accepting tasks.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.incoming.lock().closed
    }

    /// Returns `true` if this loop is running on the current thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT_LOOP
            .try_with(|current| {
                current
                    .borrow()
                    .as_ref()
                    .is_some_and(|running| running.id() == self.id())
            })
            .unwrap_or(false)
    }

    /// Spawns `future` onto the loop.
    ///
    /// The task starts from a copy of the caller's context. When spawned
    /// from a task on the same loop it also inherits the caller's
    /// thread-critical values. Fails with [`ErrorKind::LoopClosed`] once the
    /// loop has closed.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pinned = if self.is_current() {
            context::pinned_frame().pinned_copy()
        } else {
            PinnedMap::new()
        };
        self.spawn_in(Frame::pinned(context::capture(), pinned), future)
    }

    /// Spawns `future` with an explicit starting context.
    pub fn spawn_with_context<F>(
        &self,
        snapshot: ContextSnapshot,
        future: F,
    ) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_in(Frame::pinned(snapshot, PinnedMap::new()), future)
    }

    fn spawn_in<F>(&self, frame: Arc<Frame>, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, handle) = Task::new(future, frame);
        match self.submit(task) {
            Ok(()) => Ok(handle),
            Err(task) => {
                task.discard();
                Err(self.closed_error())
            }
        }
    }

    /// Queues an already-built task, handing it back if the loop is closed.
    pub(crate) fn submit(&self, task: Task) -> std::result::Result<(), Task> {
        let id = task.id;
        {
            let mut incoming = self.shared.incoming.lock();
            if incoming.closed {
                return Err(task);
            }
            incoming.tasks.push(task);
        }
        trace!(loop_id = %self.shared.id, task_id = %id, "task queued");
        self.shared.wake.notify();
        Ok(())
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::new(ErrorKind::LoopClosed).with_message(format!("{} is closed", self.shared.id))
    }

    fn add_timer(&self, deadline: Instant, waker: Waker) {
        self.shared.timers.lock().insert(deadline, waker);
        self.shared.wake.notify();
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a spawned task's outcome.
///
/// Awaiting the handle yields the task's output, or a `Cancelled` error if
/// the task was cancelled. A panic inside the task is resumed on the
/// awaiting side. Dropping the handle detaches the task.
pub struct JoinHandle<T> {
    id: TaskId,
    slot: Arc<ResultSlot<T>>,
    token: CancelToken,
}

impl<T> JoinHandle<T> {
    /// Returns the task's id.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Returns `true` once the task has produced an outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Requests cancellation of the task.
    ///
    /// Returns `true` on the first request.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::user("cancelled through join handle"))
    }

    /// Requests cancellation with an explicit reason.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.token.cancel(reason)
    }

    /// Blocks the current thread until the task finishes.
    ///
    /// Fails with [`ErrorKind::Usage`] on a loop thread, where blocking
    /// would stall the loop.
    pub fn join_blocking(self) -> Result<T> {
        if is_loop_thread() {
            return Err(Error::usage("join_blocking called on an event loop thread"));
        }
        match self.slot.wait() {
            Some(outcome) => outcome.into_result(),
            None => Err(Error::internal("task outcome already taken")),
        }
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn probe(&self) -> Arc<dyn SlotProbe> {
        Arc::clone(&self.slot) as Arc<dyn SlotProbe>
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        self.slot.poll_take(cx).map(|outcome| match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(Error::internal("task outcome already taken")),
        })
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Waits until `duration` has elapsed.
///
/// On a loop thread the wait is a loop timer. Elsewhere a helper thread
/// wakes the future, so it also works under any other executor.
#[must_use]
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        registered: None,
        helper: false,
    }
}

/// Future returned by [`sleep`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    deadline: Instant,
    registered: Option<Waker>,
    helper: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            return Poll::Ready(());
        }
        if this
            .registered
            .as_ref()
            .is_some_and(|w| w.will_wake(cx.waker()))
        {
            return Poll::Pending;
        }
        if let Ok(handle) = current_loop() {
            handle.add_timer(this.deadline, cx.waker().clone());
            this.registered = Some(cx.waker().clone());
        } else if !this.helper {
            this.helper = true;
            let deadline = this.deadline;
            let waker = cx.waker().clone();
            thread::spawn(move || {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                waker.wake();
            });
        }
        Poll::Pending
    }
}

/// Yields once to the loop, letting other ready tasks run.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::types::CancelKind;
    use crate::Local;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn runs_root_to_completion() {
        init_test_logging();
        crate::test_phase!("runs_root_to_completion");
        let out = EventLoop::block_on(async { 40 + 2 }).unwrap();
        assert_eq!(out, 42);
        crate::test_complete!("runs_root_to_completion");
    }

    #[test]
    fn nested_run_is_usage_error() {
        init_test_logging();
        let err = EventLoop::block_on(async { EventLoop::block_on(async {}).unwrap_err() })
            .unwrap();
        assert!(err.is_usage());
    }

    #[test]
    fn current_loop_outside_is_error() {
        let err = current_loop().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoRunningLoop);
        assert!(current_task().is_none());
    }

    #[test]
    fn spawned_tasks_run_and_join() {
        init_test_logging();
        let out = EventLoop::block_on(async {
            let handle = current_loop().unwrap();
            let a = handle.spawn(async { 1 }).unwrap();
            let b = handle
                .spawn(async {
                    yield_now().await;
                    2
                })
                .unwrap();
            a.await.unwrap() + b.await.unwrap()
        })
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn spawn_from_another_thread() {
        init_test_logging();
        let out = EventLoop::block_on(async {
            let handle = current_loop().unwrap();
            let join = thread::spawn(move || handle.spawn(async { 7 }).unwrap())
                .join()
                .unwrap();
            join.await.unwrap()
        })
        .unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn sleep_waits_on_loop_timer() {
        init_test_logging();
        let start = Instant::now();
        EventLoop::block_on(sleep(Duration::from_millis(30))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_works_off_loop() {
        let start = Instant::now();
        futures_lite::future::block_on(sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_drops_pending_task() {
        init_test_logging();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        let err = EventLoop::block_on(async move {
            struct OnDrop(Arc<AtomicBool>);
            impl Drop for OnDrop {
                fn drop(&mut self) {
                    self.0.store(true, Ordering::SeqCst);
                }
            }
            let handle = current_loop().unwrap();
            let task = handle
                .spawn(async move {
                    let _guard = OnDrop(flag);
                    sleep(Duration::from_secs(60)).await;
                })
                .unwrap();
            yield_now().await;
            assert!(task.cancel());
            task.await.unwrap_err()
        })
        .unwrap();
        assert!(err.is_cancelled());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_guard_keeps_task_alive_through_cancel() {
        init_test_logging();
        let out = EventLoop::block_on(async {
            let handle = current_loop().unwrap();
            let task = handle
                .spawn(async {
                    let token = current_cancel_token().unwrap();
                    let _drain = token.drain_guard();
                    let reason = token.cancelled().await;
                    sleep(Duration::from_millis(10)).await;
                    reason.kind
                })
                .unwrap();
            yield_now().await;
            task.cancel();
            task.await.unwrap()
        })
        .unwrap();
        assert_eq!(out, CancelKind::User);
    }

    #[test]
    fn remaining_tasks_cancelled_with_shutdown_when_root_finishes() {
        init_test_logging();
        let handle_slot = Arc::new(Mutex::new(None));
        let keep = Arc::clone(&handle_slot);
        let event_loop = EventLoop::new();
        let lh = event_loop.handle();
        event_loop
            .run(async move {
                let join = current_loop()
                    .unwrap()
                    .spawn(sleep(Duration::from_secs(60)))
                    .unwrap();
                *keep.lock() = Some(join);
            })
            .unwrap();
        assert!(lh.is_closed());
        let join = handle_slot.lock().take().unwrap();
        let err = futures_lite::future::block_on(join).unwrap_err();
        assert!(err.is_cancelled());
        assert!(lh.spawn(async {}).unwrap_err().kind() == ErrorKind::LoopClosed);
    }

    #[test]
    fn task_panic_resumes_on_join() {
        init_test_logging();
        let caught = EventLoop::block_on(async {
            let handle = current_loop().unwrap();
            let task = handle.spawn(async { panic!("task boom") }).unwrap();
            AssertUnwindSafe(task).catch_unwind().await
        })
        .unwrap();
        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"task boom"));
    }

    #[test]
    fn tasks_inherit_but_do_not_share_locals() {
        init_test_logging();
        let local = Arc::new(Local::new());
        let critical = Arc::new(Local::thread_critical());
        let (l, c) = (Arc::clone(&local), Arc::clone(&critical));
        EventLoop::block_on(async move {
            l.set("a", 1_i32);
            c.set("a", 1_i32);
            let (l2, c2) = (Arc::clone(&l), Arc::clone(&c));
            current_loop()
                .unwrap()
                .spawn(async move {
                    assert_eq!(l2.get_as::<i32>("a").unwrap(), 1);
                    assert_eq!(c2.get_as::<i32>("a").unwrap(), 1);
                    l2.set("a", 2_i32);
                    c2.set("a", 2_i32);
                })
                .unwrap()
                .await
                .unwrap();
            assert_eq!(l.get_as::<i32>("a").unwrap(), 1);
            assert_eq!(c.get_as::<i32>("a").unwrap(), 1);
        })
        .unwrap();
        assert!(!local.contains("a"));
        assert!(!critical.contains("a"));
    }

    #[test]
    fn cancelled_before_start_never_runs() {
        init_test_logging();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let event_loop = EventLoop::new();
        let join = event_loop
            .handle()
            .spawn(async move {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        join.cancel();
        event_loop.run(async {}).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(join.join_blocking().unwrap_err().is_cancelled());
    }
}
