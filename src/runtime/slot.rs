//! Single-assignment result slots.
//!
//! A [`ResultSlot`] carries the [`Outcome`] of one piece of work from the
//! thread that produced it to whoever waits for it: a blocked thread
//! ([`ResultSlot::wait`]), a future ([`ResultSlot::poll_take`]) or an idle
//! executor ([`SlotProbe`]). The first completion wins; later completions
//! are rejected and their values dropped.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::types::{CancelReason, Outcome};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A single-assignment slot holding an [`Outcome`].
pub struct ResultSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

struct SlotState<T> {
    outcome: Option<Outcome<T>>,
    resolved: bool,
    cancelled: bool,
    wakers: Vec<Waker>,
    callbacks: Vec<Callback>,
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                resolved: false,
                cancelled: false,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }
}

impl<T> ResultSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty shared slot.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Resolves the slot.
    ///
    /// Returns `false` and drops `outcome` if the slot was already resolved.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.state.lock();
            if state.resolved {
                return false;
            }
            state.resolved = true;
            state.cancelled = outcome.is_cancelled();
            state.outcome = Some(outcome);
            self.ready.notify_all();
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Resolves the slot as cancelled unless it already holds an outcome.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.complete(Outcome::Cancelled(reason))
    }

    /// Returns `true` once the slot has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state.lock().resolved
    }

    /// Returns `true` if the slot was resolved as cancelled.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Takes the outcome if the slot is resolved and not yet taken.
    pub fn take(&self) -> Option<Outcome<T>> {
        self.state.lock().outcome.take()
    }

    /// Blocks the calling thread until the slot resolves, then takes the
    /// outcome.
    ///
    /// Returns `None` if the outcome was already taken.
    pub fn wait(&self) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        while !state.resolved {
            self.ready.wait(&mut state);
        }
        state.outcome.take()
    }

    /// Polls for resolution and takes the outcome when ready.
    ///
    /// Resolves to `None` if the outcome was already taken.
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Option<Outcome<T>>> {
        let mut state = self.state.lock();
        if state.resolved {
            return Poll::Ready(state.outcome.take());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Runs `callback` once the slot resolves, immediately if it already has.
    pub fn on_resolved<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.resolved {
            drop(state);
            callback();
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }
}

impl<T> fmt::Debug for ResultSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResultSlot")
            .field("resolved", &state.resolved)
            .field("cancelled", &state.cancelled)
            .field("taken", &(state.resolved && state.outcome.is_none()))
            .finish()
    }
}

/// Type-erased view of a slot's resolution.
pub trait SlotProbe: Send + Sync {
    /// Returns `true` once resolved.
    fn is_resolved(&self) -> bool;

    /// Returns `true` if resolved as cancelled.
    fn was_cancelled(&self) -> bool;

    /// Polls for resolution without taking the outcome.
    fn poll_resolved(&self, cx: &mut Context<'_>) -> Poll<()>;

    /// Runs `callback` once resolved.
    fn on_resolved_boxed(&self, callback: Callback);
}

impl<T: Send> SlotProbe for ResultSlot<T> {
    fn is_resolved(&self) -> bool {
        ResultSlot::is_resolved(self)
    }

    fn was_cancelled(&self) -> bool {
        ResultSlot::was_cancelled(self)
    }

    fn poll_resolved(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.resolved {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    fn on_resolved_boxed(&self, callback: Callback) {
        self.on_resolved(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PanicPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_completion_wins() {
        let slot = ResultSlot::new();
        assert!(slot.complete(Outcome::Ok(1)));
        assert!(!slot.complete(Outcome::Ok(2)));
        assert!(!slot.cancel(CancelReason::shutdown()));
        assert!(matches!(slot.take(), Some(Outcome::Ok(1))));
        assert!(slot.take().is_none());
        assert!(!slot.was_cancelled());
    }

    #[test]
    fn racing_completions_resolve_exactly_once() {
        let slot: Arc<ResultSlot<usize>> = ResultSlot::shared();
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slot = Arc::clone(&slot);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    let outcome = match i % 3 {
                        0 => Outcome::Ok(i),
                        1 => Outcome::Cancelled(CancelReason::abandoned()),
                        _ => Outcome::Panicked(PanicPayload::new(Box::new("boom"))),
                    };
                    if slot.complete(outcome) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(slot.is_resolved());
    }

    #[test]
    fn wait_blocks_until_completed_elsewhere() {
        let slot: Arc<ResultSlot<&str>> = ResultSlot::shared();
        let remote = Arc::clone(&slot);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.complete(Outcome::Ok("done"));
        });
        assert!(matches!(slot.wait(), Some(Outcome::Ok("done"))));
    }

    #[test]
    fn callbacks_fire_once_including_late_registration() {
        let slot: ResultSlot<()> = ResultSlot::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        slot.on_resolved(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        slot.cancel(CancelReason::user("stop"));
        let h = Arc::clone(&hits);
        slot.on_resolved(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(slot.was_cancelled());
    }

    #[test]
    fn poll_take_wakes_future() {
        let slot: Arc<ResultSlot<u8>> = ResultSlot::shared();
        let remote = Arc::clone(&slot);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete(Outcome::Ok(9));
        });
        let outcome = futures_lite::future::block_on(futures_lite::future::poll_fn(|cx| {
            slot.poll_take(cx)
        }));
        assert!(matches!(outcome, Some(Outcome::Ok(9))));
    }
}
