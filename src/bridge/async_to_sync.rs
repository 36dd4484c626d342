//! Running async callables from blocking code.
//!
//! [`AsyncToSync::call`] blocks the calling thread until the future built by
//! the wrapped callable completes. While it waits, the thread serves an
//! [`IdleExecutor`], so thread-sensitive sync work the future sends back
//! through `sync_to_async` runs on this same thread.
//!
//! When the caller is itself a `sync_to_async` callee, the future runs as a
//! task on the loop that is awaiting the callee. Otherwise (and after a
//! fork, or when that loop has closed) a private loop is started on a
//! dedicated thread for the duration of the call.

use std::borrow::Cow;
use std::fmt;
use std::future::{poll_fn, Future};
use std::sync::Arc;
use std::thread;

use super::pending::{JobCompletion, NestedTask};
use super::registry::LaunchRecord;
use super::{Bridge, BridgeState};
use crate::error::{Error, Result, ResultExt};
use crate::local::context::{self, Frame, PinnedMap};
use crate::runtime::event_loop::Task;
use crate::runtime::{is_loop_thread, EventLoop, IdleExecutor, ResultSlot, SlotProbe};
use crate::tracing_compat::{debug, trace};
use crate::types::Outcome;

/// Wraps `func` for use from blocking code, using the process default bridge.
///
/// ```
/// let answer = syncbridge::async_to_sync(|x: u32| async move { x * 2 });
/// assert_eq!(answer.call(42).unwrap(), 84);
/// ```
pub fn async_to_sync<F>(func: F) -> AsyncToSync<F> {
    Bridge::global().async_to_sync(func)
}

/// An async callable made blocking.
pub struct AsyncToSync<F> {
    func: Arc<F>,
    bridge: Bridge,
    force_new_loop: bool,
    name: Cow<'static, str>,
}

impl<F> AsyncToSync<F> {
    pub(crate) fn new(bridge: Bridge, func: F) -> Self {
        Self {
            func: Arc::new(func),
            bridge,
            force_new_loop: false,
            name: Cow::Borrowed(std::any::type_name::<F>()),
        }
    }

    /// Always run on a private loop, even inside a `sync_to_async` callee.
    #[must_use]
    pub fn force_new_loop(mut self, enabled: bool) -> Self {
        self.force_new_loop = enabled;
        self
    }

    /// Names the callable in logs.
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

    /// Runs the future built by the wrapped callable to completion.
    ///
    /// Fails with `Usage` on a thread running an event loop, and with
    /// `Cancelled` if the task was cancelled. A panic inside the future is
    /// resumed here.
    pub fn call<A, Fut>(&self, args: A) -> Result<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if is_loop_thread() {
            return Err(Error::usage(format!(
                "{}: async_to_sync cannot be called from a thread running an event loop; \
                 await the future directly",
                self.name
            )));
        }
        let registry = self.bridge.registry();
        let record = registry.launch_record();
        let main_loop = record.as_ref().filter(|record| self.can_reuse(record));

        let caller_state = BridgeState::current();
        let executor = IdleExecutor::new(caller_state.idle_executor.clone());
        let mut snapshot = context::capture();
        snapshot.set_extension(BridgeState {
            idle_executor: Some(executor.clone()),
            ..caller_state
        });
        let frame = Frame::pinned(snapshot, PinnedMap::new());
        let (task, join) = Task::new((self.func)(args), Arc::clone(&frame));
        let probe = join.probe();
        let task_id = task.id();

        let _task_entry = registry.enter_task(task_id, thread::current().id());
        let _nested = record.as_ref().map(|record| {
            record.nested.register(NestedTask {
                id: task_id,
                token: join.token().clone(),
                probe: Arc::clone(&probe),
            })
        });

        let private = match main_loop {
            Some(record) => {
                trace!(
                    callable = %self.name,
                    loop_id = %record.loop_handle.id(),
                    task_id = %task.id(),
                    "async_to_sync on launching loop"
                );
                match record.loop_handle.submit(task) {
                    Ok(()) => {
                        executor.run_until(probe.as_ref())?;
                        None
                    }
                    Err(task) => Some(task),
                }
            }
            None => Some(task),
        };
        if let Some(task) = private {
            self.run_private(task, &executor, &probe)?;
        }

        context::merge_into_current(&frame.snapshot());
        join.join_blocking()
            .for_callable(&self.name)
            .in_task(Some(task_id))
    }

    fn can_reuse(&self, record: &LaunchRecord) -> bool {
        if self.force_new_loop {
            return false;
        }
        let pid = self.bridge.process_id();
        if record.process_id != pid {
            debug!(
                callable = %self.name,
                recorded = record.process_id,
                current = pid,
                "launch record belongs to another process, starting a private loop"
            );
            return false;
        }
        !record.loop_handle.is_closed()
    }

    /// Runs `task` on a fresh loop thread while this thread idles.
    fn run_private(
        &self,
        task: Task,
        executor: &IdleExecutor,
        probe: &Arc<dyn SlotProbe>,
    ) -> Result<()> {
        let event_loop = EventLoop::new();
        let loop_id = event_loop.id();
        let registry = self.bridge.registry();
        let _loop_entry = registry.enter_loop(loop_id, executor.clone());
        if let Err(task) = event_loop.handle().submit(task) {
            task.discard();
            return Err(Error::internal("fresh event loop refused a task"));
        }
        trace!(callable = %self.name, loop_id = %loop_id, "async_to_sync on private loop");

        let loop_done: Arc<ResultSlot<()>> = ResultSlot::shared();
        let completion = JobCompletion::new(Arc::clone(&loop_done));
        let root = Arc::clone(probe);
        let runner = thread::Builder::new()
            .name(self.bridge.config().thread_name("loop"))
            .spawn(move || {
                let result = event_loop.run(poll_fn(|cx| root.poll_resolved(cx)));
                completion.complete(Outcome::Ok(()));
                result
            })
            .map_err(|err| Error::internal("failed to spawn loop thread").with_source(err))?;

        executor.run_until(loop_done.as_ref())?;
        match runner.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

impl<F> Clone for AsyncToSync<F> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            bridge: self.bridge.clone(),
            force_new_loop: self.force_new_loop,
            name: self.name.clone(),
        }
    }
}

impl<F> fmt::Debug for AsyncToSync<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncToSync")
            .field("name", &self.name)
            .field("force_new_loop", &self.force_new_loop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RegistryStats;
    use crate::runtime::{current_loop, sleep};
    use crate::test_utils::{init_test_logging, run_test, test_bridge};
    use crate::types::CancelKind;
    use crate::Local;
    use std::panic::AssertUnwindSafe;
    use std::time::Duration;

    #[test]
    fn runs_future_from_plain_thread() {
        init_test_logging();
        crate::test_phase!("runs_future_from_plain_thread");
        let bridge = test_bridge();
        let f = bridge.async_to_sync(|()| async {
            sleep(Duration::ZERO).await;
            84
        });
        assert_eq!(f.call(()).unwrap(), 84);
        assert_eq!(bridge.registry().stats(), RegistryStats::default());
        crate::test_complete!("runs_future_from_plain_thread");
    }

    #[test]
    fn loop_thread_is_usage_error() {
        init_test_logging();
        let bridge = test_bridge();
        let f = bridge.async_to_sync(|()| async { 1 });
        let err = run_test(async move { f.call(()).unwrap_err() });
        assert!(err.is_usage());
    }

    #[test]
    fn reuses_the_launching_loop() {
        init_test_logging();
        let bridge = test_bridge();
        let inner_bridge = bridge.clone();
        let outer = bridge.sync_to_async(move |()| {
            inner_bridge
                .async_to_sync(|()| async { current_loop().unwrap().id() })
                .call(())
                .unwrap()
        });
        let (outer_loop, inner_loop) = run_test(async {
            let outer_loop = current_loop().unwrap().id();
            (outer_loop, outer.call(()).await.unwrap())
        });
        assert_eq!(outer_loop, inner_loop);
    }

    #[test]
    fn force_new_loop_starts_private_loop() {
        init_test_logging();
        let bridge = test_bridge();
        let inner_bridge = bridge.clone();
        let outer = bridge.sync_to_async(move |()| {
            inner_bridge
                .async_to_sync(|()| async { current_loop().unwrap().id() })
                .force_new_loop(true)
                .call(())
                .unwrap()
        });
        let (outer_loop, inner_loop) = run_test(async {
            let outer_loop = current_loop().unwrap().id();
            (outer_loop, outer.call(()).await.unwrap())
        });
        assert_ne!(outer_loop, inner_loop);
    }

    #[test]
    fn panic_resumes_on_caller() {
        init_test_logging();
        let bridge = test_bridge();
        let f = bridge.async_to_sync(|()| async {
            if true {
                panic!("future boom");
            }
        });
        let payload = std::panic::catch_unwind(AssertUnwindSafe(|| f.call(()))).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"future boom"));
    }

    #[test]
    fn cancelled_task_is_cancelled_error() {
        init_test_logging();
        let bridge = test_bridge();
        let f = bridge.async_to_sync(|()| async {
            let token = crate::runtime::event_loop::current_cancel_token().unwrap();
            token.cancel(crate::types::CancelReason::user("self cancel"));
            sleep(Duration::from_secs(30)).await;
        });
        let err = f.named("self_cancel").call(()).unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains(&CancelKind::User.to_string()));
        assert_eq!(err.context().callable.as_deref(), Some("self_cancel"));
        assert!(err.context().task_id.is_some());
    }

    #[test]
    fn locals_round_trip_through_the_task() {
        init_test_logging();
        let bridge = test_bridge();
        let local = Arc::new(Local::new());
        let inner = Arc::clone(&local);
        let f = bridge.async_to_sync(move |()| {
            let inner = Arc::clone(&inner);
            async move {
                let seen = inner.get_as::<&'static str>("who").unwrap();
                inner.set("who", "task");
                seen
            }
        });
        local.set("who", "caller");
        assert_eq!(f.call(()).unwrap(), "caller");
        assert_eq!(local.get_as::<&'static str>("who").unwrap(), "task");
        local.delete("who").unwrap();
    }
}
