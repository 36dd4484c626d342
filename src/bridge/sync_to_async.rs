//! Running blocking callables from async code.
//!
//! [`SyncToAsync::call`] ships the callable, its arguments and a snapshot of
//! the caller's context to a worker thread and suspends the calling task
//! until the callee returns. The callee's changes to context-local values
//! are merged back into the caller afterwards.
//!
//! # Where the callee runs
//!
//! Thread-sensitive calls (the default) go to the first of:
//!
//! 1. the idle executor of a blocked `async_to_sync` caller found in the
//!    context, so nested sync work returns to the thread that started it
//! 2. the worker of the open [`ThreadSensitiveContext`](super::ThreadSensitiveContext)
//! 3. the idle executor registered for the current loop
//! 4. the bridge-wide single-thread slot
//!
//! A call that would queue on the single-thread slot while its own caller
//! occupies that slot fails fast with `Deadlock` instead.
//!
//! Other calls run on the caller-supplied pool or the bridge's default pool.
//!
//! # Cancellation
//!
//! If the awaiting task is cancelled, the oldest async task the callee
//! launched through `async_to_sync` is cancelled and awaited first. Unless
//! that task finished normally, a callee that has not started yet is
//! withdrawn. The call then resolves to `Cancelled` once the callee is no
//! longer running; a callee panic still takes precedence. A cancel that
//! arrives after the callee returned, but before the caller resumed, also
//! resolves to `Cancelled`.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::future::{poll_fn, Future};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;

use super::pending::{JobCompletion, NestedTasks};
use super::registry::LaunchRecord;
use super::{Bridge, BridgeState};
use crate::error::{Error, Result, ResultExt};
use crate::local::context::{self, ContextSnapshot};
use crate::runtime::event_loop::current_cancel_token;
use crate::runtime::{
    current_loop, current_task, BlockingPoolHandle, CancelToken, Job, LoopHandle, ResultSlot,
    SlotProbe, Submission,
};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{CancelReason, Outcome, PanicPayload};

/// Wraps `func` for use from async code, using the process default bridge.
///
/// ```
/// use syncbridge::runtime::EventLoop;
///
/// let read = syncbridge::sync_to_async(|path: &'static str| path.len());
/// let len = EventLoop::block_on(read.call("/etc/hosts")).unwrap().unwrap();
/// assert_eq!(len, 10);
/// ```
///
/// `func` should be blocking code. A closure that returns a future is
/// accepted, since its return type cannot be told apart from any other
/// value, but the future is only constructed on the worker and comes back
/// unpolled. Await async callables directly instead.
pub fn sync_to_async<F>(func: F) -> SyncToAsync<F> {
    Bridge::global().sync_to_async(func)
}

/// A blocking callable made awaitable.
///
/// See [`sync_to_async`] for why wrapping a future-returning closure is
/// allowed but never useful.
pub struct SyncToAsync<F> {
    func: Arc<F>,
    bridge: Bridge,
    thread_sensitive: bool,
    executor: Option<BlockingPoolHandle>,
    name: Cow<'static, str>,
}

impl<F> SyncToAsync<F> {
    pub(crate) fn new(bridge: Bridge, func: F) -> Self {
        Self {
            func: Arc::new(func),
            bridge,
            thread_sensitive: true,
            executor: None,
            name: Cow::Borrowed(std::any::type_name::<F>()),
        }
    }

    /// Chooses between the thread-sensitive slot (default) and a pool.
    #[must_use]
    pub fn thread_sensitive(mut self, enabled: bool) -> Self {
        self.thread_sensitive = enabled;
        self
    }

    /// Runs non-thread-sensitive calls on `pool` instead of the default pool.
    ///
    /// Calls fail with `Usage` unless thread sensitivity is disabled.
    #[must_use]
    pub fn executor(mut self, pool: BlockingPoolHandle) -> Self {
        self.executor = Some(pool);
        self
    }

    /// Names the callable in logs and errors.
    #[must_use]
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// The callable's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if calls use the thread-sensitive slot.
    #[must_use]
    pub fn is_thread_sensitive(&self) -> bool {
        self.thread_sensitive
    }

    /// Calls the wrapped function with `args` on a worker thread.
    ///
    /// The returned future must be polled on an
    /// [`EventLoop`](crate::runtime::EventLoop) task; elsewhere it fails with
    /// `NoRunningLoop`. The callee's return value is delivered as is and a
    /// callee panic is resumed on the awaiting task.
    pub fn call<A, R>(&self, args: A) -> impl Future<Output = Result<R>> + Send + 'static
    where
        F: Fn(A) -> R + Send + Sync + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        let crossing = Crossing {
            func: Arc::clone(&self.func),
            bridge: self.bridge.clone(),
            thread_sensitive: self.thread_sensitive,
            executor: self.executor.clone(),
            name: self.name.clone(),
        };
        crossing.run(args)
    }
}

impl<F> Clone for SyncToAsync<F> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            bridge: self.bridge.clone(),
            thread_sensitive: self.thread_sensitive,
            executor: self.executor.clone(),
            name: self.name.clone(),
        }
    }
}

impl<F> fmt::Debug for SyncToAsync<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncToAsync")
            .field("name", &self.name)
            .field("thread_sensitive", &self.thread_sensitive)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

/// Where a callee was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    IdleExecutor,
    Scope,
    LoopExecutor,
    SingleSlot,
    Pool,
}

impl Target {
    const fn as_str(self) -> &'static str {
        match self {
            Self::IdleExecutor => "idle_executor",
            Self::Scope => "scope",
            Self::LoopExecutor => "loop_executor",
            Self::SingleSlot => "single_slot",
            Self::Pool => "pool",
        }
    }
}

/// Everything one call needs, owned so the future is `'static`.
struct Crossing<F> {
    func: Arc<F>,
    bridge: Bridge,
    thread_sensitive: bool,
    executor: Option<BlockingPoolHandle>,
    name: Cow<'static, str>,
}

impl<F> Crossing<F> {
    async fn run<A, R>(self, args: A) -> Result<R>
    where
        F: Fn(A) -> R + Send + Sync + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        let handle = current_loop()?;
        if self.thread_sensitive && self.executor.is_some() {
            return Err(Error::usage(format!(
                "{}: a custom executor requires thread_sensitive(false)",
                self.name
            )));
        }
        let token = current_cancel_token().unwrap_or_else(CancelToken::new);
        let state = BridgeState::current();

        let slot: Arc<ResultSlot<R>> = ResultSlot::shared();
        // Filled by `dispatch` before each submission attempt; taken by the
        // job when it starts.
        let callee_input: Arc<Mutex<Option<ContextSnapshot>>> = Arc::new(Mutex::new(None));
        let callee_output: Arc<Mutex<Option<ContextSnapshot>>> = Arc::new(Mutex::new(None));
        let nested = NestedTasks::default();
        let task = current_task();
        let record = LaunchRecord {
            loop_handle: handle.clone(),
            task,
            process_id: self.bridge.process_id(),
            nested: nested.clone(),
        };

        let job = Job::new({
            let bridge = self.bridge.clone();
            let func = Arc::clone(&self.func);
            let input = Arc::clone(&callee_input);
            let output = Arc::clone(&callee_output);
            let completion = JobCompletion::new(Arc::clone(&slot));
            move || {
                let snapshot = input.lock().take().unwrap_or_default();
                let (outcome, snapshot) = {
                    let _launch = bridge.registry().enter_thread(record);
                    context::run_in(snapshot, || {
                        match catch_unwind(AssertUnwindSafe(|| func(args))) {
                            Ok(value) => Outcome::Ok(value),
                            Err(payload) => Outcome::Panicked(PanicPayload::new(payload)),
                        }
                    })
                };
                *output.lock() = Some(snapshot);
                completion.complete(outcome);
            }
        });
        let (submission, target) = self
            .dispatch(&handle, &state, context::capture(), &callee_input, job)
            .for_callable(&self.name)
            .on_loop(handle.id())
            .in_task(task)?;
        trace!(
            callable = %self.name,
            thread_sensitive = self.thread_sensitive,
            slot = target.as_str(),
            loop_id = %handle.id(),
            "sync_to_async dispatched"
        );

        let drain = token.drain_guard();
        // A cancel that lands after the callee finished still wins.
        let cancelled = poll_fn(|cx| {
            if let Poll::Ready(reason) = token.poll_cancelled(cx) {
                return Poll::Ready(Some(reason));
            }
            slot.poll_resolved(cx).map(|()| None)
        })
        .await;

        let outcome = match cancelled {
            None => slot.take(),
            Some(reason) => Some(Self::cancel(&self.name, &slot, &submission, &nested, reason).await),
        };
        drop(drain);

        let callee_ctx = callee_output.lock().take();
        if let Some(callee_ctx) = callee_ctx {
            context::merge_into_current(&callee_ctx);
        }
        let result = match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(Error::internal("callee outcome already taken")),
        };
        result
            .for_callable(&self.name)
            .on_loop(handle.id())
            .in_task(task)
    }

    /// Picks the executor and submits `job`, handing it `snapshot`.
    fn dispatch(
        &self,
        handle: &LoopHandle,
        state: &BridgeState,
        snapshot: ContextSnapshot,
        callee_input: &Mutex<Option<ContextSnapshot>>,
        job: Job,
    ) -> Result<(Submission, Target)> {
        if !self.thread_sensitive {
            let pool = self
                .executor
                .clone()
                .unwrap_or_else(|| self.bridge.default_pool());
            *callee_input.lock() = Some(snapshot);
            return Ok((pool.submit(job)?, Target::Pool));
        }

        *callee_input.lock() = Some(snapshot.clone());
        let mut job = job;
        if let Some(executor) = &state.idle_executor {
            match executor.try_submit(job) {
                Ok(submission) => return Ok((submission, Target::IdleExecutor)),
                Err(returned) => job = returned,
            }
        }
        if let Some(pool) = state.scope.and_then(|id| self.bridge.scope_pool(id)) {
            return Ok((pool.submit(job)?, Target::Scope));
        }
        if let Some(executor) = self.bridge.registry().loop_executor(handle.id()) {
            match executor.try_submit(job) {
                Ok(submission) => return Ok((submission, Target::LoopExecutor)),
                Err(returned) => job = returned,
            }
        }
        if state.sync_in_flight && self.bridge.config().deadlock_detection {
            warn!(callable = %self.name, "thread-sensitive call would deadlock");
            drop(job);
            return Err(Error::deadlock(&self.name));
        }

        let mut flagged = snapshot;
        flagged.set_extension(BridgeState {
            sync_in_flight: true,
            ..state.clone()
        });
        *callee_input.lock() = Some(flagged);
        Ok((self.bridge.single_slot().submit(job)?, Target::SingleSlot))
    }

    async fn cancel<R: Send + 'static>(
        name: &str,
        slot: &ResultSlot<R>,
        submission: &Submission,
        nested: &NestedTasks,
        reason: CancelReason,
    ) -> Outcome<R> {
        debug!(callable = %name, reason = %reason, "sync_to_async cancelled");
        let mut cancel_parent = true;
        if let Some(task) = nested.first() {
            task.token.cancel(CancelReason::parent_cancelled());
            poll_fn(|cx| task.probe.poll_resolved(cx)).await;
            cancel_parent = task.probe.was_cancelled();
        }
        if cancel_parent && !slot.is_resolved() && submission.withdraw() {
            trace!(callable = %name, "withdrew unstarted callee");
            slot.cancel(reason.clone());
        }
        poll_fn(|cx| SlotProbe::poll_resolved(slot, cx)).await;
        match slot.take() {
            Some(Outcome::Panicked(payload)) => Outcome::Panicked(payload),
            Some(outcome) if !cancel_parent => outcome,
            _ => Outcome::Cancelled(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::{sleep, yield_now, BlockingPool, EventLoop};
    use crate::test_utils::{init_test_logging, run_test, test_bridge};
    use crate::Local;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn returns_callee_value() {
        init_test_logging();
        crate::test_phase!("returns_callee_value");
        let bridge = test_bridge();
        let add = bridge.sync_to_async(|(a, b): (i32, i32)| a + b);
        let out = run_test(add.call((40, 2))).unwrap();
        crate::assert_with_log!(out == 42, "sum", 42, out);
        crate::test_complete!("returns_callee_value");
    }

    #[test]
    fn outside_loop_is_no_running_loop() {
        init_test_logging();
        let bridge = test_bridge();
        let f = bridge.sync_to_async(|(): ()| 1);
        let err = futures_lite::future::block_on(f.call(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoRunningLoop);
    }

    #[test]
    fn callee_result_is_not_wrapped() {
        init_test_logging();
        let bridge = test_bridge();
        let parse = bridge.sync_to_async(|s: &'static str| s.parse::<u8>());
        let out = run_test(parse.call("x")).unwrap();
        assert!(out.is_err());
    }

    #[test]
    fn thread_sensitive_calls_share_one_thread() {
        init_test_logging();
        let bridge = test_bridge();
        let who = bridge.sync_to_async(|(): ()| thread::current().id());
        let (a, b) = run_test(async {
            let a = who.call(()).await.unwrap();
            let b = who.call(()).await.unwrap();
            (a, b)
        });
        assert_eq!(a, b);
        assert_ne!(a, thread::current().id());
    }

    #[test]
    fn custom_executor_requires_non_sensitive() {
        init_test_logging();
        let bridge = test_bridge();
        let pool = BlockingPool::new(0, 1);
        let f = bridge.sync_to_async(|(): ()| 1).executor(pool.handle());
        let err = run_test(f.call(())).unwrap_err();
        assert!(err.is_usage());

        let f = f.thread_sensitive(false);
        assert_eq!(run_test(f.call(())).unwrap(), 1);
    }

    #[test]
    fn custom_executor_runs_the_callee() {
        init_test_logging();
        let bridge = test_bridge();
        let pool = BlockingPool::new(0, 1);
        let handle = pool.handle();
        let probe = handle.clone();
        let f = bridge
            .sync_to_async(move |(): ()| probe.is_current_worker())
            .thread_sensitive(false)
            .executor(handle);
        assert!(run_test(f.call(())).unwrap());
    }

    #[test]
    fn callee_panic_resumes_with_payload() {
        init_test_logging();
        let bridge = test_bridge();
        let boom = bridge.sync_to_async(|(): ()| -> u8 { panic!("callee boom") });
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| run_test(boom.call(()))));
        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"callee boom"));
    }

    #[test]
    fn locals_cross_and_merge_back() {
        init_test_logging();
        let bridge = test_bridge();
        let local = Arc::new(Local::new());
        let inner = Arc::clone(&local);
        let bump = bridge.sync_to_async(move |(): ()| {
            let seen = inner.get_as::<u32>("n").unwrap();
            inner.set("n", seen + 1);
            seen
        });
        let (seen, after) = run_test(async {
            local.set("n", 1_u32);
            let seen = bump.call(()).await.unwrap();
            (seen, local.get_as::<u32>("n").unwrap())
        });
        assert_eq!(seen, 1);
        assert_eq!(after, 2);
    }

    #[test]
    fn unstarted_callee_is_withdrawn_on_cancel() {
        init_test_logging();
        let bridge = test_bridge();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let block = bridge.sync_to_async(|(): ()| thread::sleep(Duration::from_millis(200)));
        let never = bridge.sync_to_async(move |(): ()| flag.store(true, Ordering::SeqCst));
        let err = run_test(async move {
            let handle = current_loop().unwrap();
            let first = handle.spawn(block.call(())).unwrap();
            yield_now().await;
            let second = handle.spawn(never.call(())).unwrap();
            sleep(Duration::from_millis(20)).await;
            second.cancel();
            let err = second.await.unwrap().unwrap_err();
            first.await.unwrap().unwrap();
            err
        });
        assert!(err.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn future_returned_by_callee_comes_back_unpolled() {
        init_test_logging();
        let bridge = test_bridge();
        let polled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&polled);
        let make = bridge.sync_to_async(move |()| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                thread::current().id()
            }
        });
        let (polled_before, ran_on, loop_thread) = run_test(async {
            let fut = make.call(()).await.unwrap();
            let polled_before = polled.load(Ordering::SeqCst);
            (polled_before, fut.await, thread::current().id())
        });
        assert!(!polled_before);
        assert_eq!(ran_on, loop_thread);
    }

    #[test]
    fn cancel_after_callee_finished_still_cancels() {
        init_test_logging();
        crate::test_phase!("cancel_after_callee_finished_still_cancels");
        let bridge = test_bridge();
        let quick = bridge
            .sync_to_async(|(): ()| {
                thread::sleep(Duration::from_millis(100));
                7
            })
            .named("quick");
        let result = run_test(async move {
            let task = current_loop().unwrap().spawn(quick.call(())).unwrap();
            sleep(Duration::from_millis(30)).await;
            // Hold the loop so the callee resolves before the caller is polled.
            thread::sleep(Duration::from_millis(300));
            assert!(!task.is_finished());
            task.cancel();
            task.await
        });
        let err = result.unwrap().unwrap_err();
        crate::assert_with_log!(err.is_cancelled(), "late cancel wins", "Cancelled", err.kind());
        assert_eq!(err.context().callable.as_deref(), Some("quick"));
        assert!(err.context().loop_id.is_some());
        assert!(err.context().task_id.is_some());
        crate::test_complete!("cancel_after_callee_finished_still_cancels");
    }

    #[test]
    fn running_callee_finishes_before_cancel_resolves() {
        init_test_logging();
        let bridge = test_bridge();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let slow = bridge.sync_to_async(move |(): ()| {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        });
        let (err, done_when_resolved) = run_test(async move {
            let task = current_loop().unwrap().spawn(slow.call(())).unwrap();
            sleep(Duration::from_millis(20)).await;
            task.cancel();
            let result = task.await;
            (result.unwrap().unwrap_err(), finished.load(Ordering::SeqCst))
        });
        assert!(err.is_cancelled());
        assert!(done_when_resolved);
    }

    #[test]
    fn deadlock_flag_only_reaches_the_callee() {
        init_test_logging();
        let bridge = test_bridge();
        let inspect = bridge.sync_to_async(|(): ()| BridgeState::current().sync_in_flight);
        let (inside, outside) = run_test(async {
            let inside = inspect.call(()).await.unwrap();
            (inside, BridgeState::current().sync_in_flight)
        });
        assert!(inside);
        assert!(!outside);
    }

    #[test]
    fn deadlock_detection_can_be_disabled() {
        init_test_logging();
        let bridge = Bridge::builder()
            .config(crate::BridgeConfig::default())
            .deadlock_detection(false)
            .build()
            .unwrap();
        let probe = bridge.sync_to_async(|(): ()| 5);
        let out = EventLoop::block_on(async {
            BridgeState::update_current(|s| s.sync_in_flight = true);
            probe.call(()).await
        })
        .unwrap()
        .unwrap();
        assert_eq!(out, 5);
    }

    #[test]
    fn flagged_context_fails_fast() {
        init_test_logging();
        let bridge = test_bridge();
        let probe = bridge.sync_to_async(|(): ()| 5).named("probe");
        let err = EventLoop::block_on(async {
            BridgeState::update_current(|s| s.sync_in_flight = true);
            probe.call(()).await
        })
        .unwrap()
        .unwrap_err();
        assert!(err.is_deadlock());
        assert_eq!(err.context().callable.as_deref(), Some("probe"));
    }
}
