//! Cancellation tokens for loop tasks.
//!
//! Every task on an [`EventLoop`](super::EventLoop) owns a [`CancelToken`].
//! Cancelling the token wakes every registered waker, and the loop polls the
//! task once more. If that poll returns `Pending` and nobody holds a
//! [`DrainGuard`] on the token, the loop drops the task's future and the task
//! ends as cancelled. Futures that must finish cleanup (for example a bridge
//! call waiting for a worker to acknowledge) take a drain guard and keep
//! being polled until they complete.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::types::CancelReason;

/// A shareable cancellation flag with waker notification.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    draining: AtomicUsize,
}

#[derive(Default)]
struct TokenState {
    reason: Option<CancelReason>,
    wakers: Vec<Waker>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    ///
    /// Returns `true` on the first request. Later requests strengthen the
    /// stored reason but do not wake anyone again.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let wakers = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.reason.as_mut() {
                existing.strengthen(&reason);
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Registers a waker to be woken on cancellation.
    ///
    /// Returns `false` (and registers nothing) if already cancelled.
    pub fn register(&self, waker: &Waker) -> bool {
        let mut state = self.inner.state.lock();
        if state.reason.is_some() {
            return false;
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
        true
    }

    /// Polls for cancellation, registering the context's waker while pending.
    pub fn poll_cancelled(&self, cx: &mut Context<'_>) -> Poll<CancelReason> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            return Poll::Ready(reason);
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Returns a future that resolves once the token is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }

    /// Keeps the owning task alive through cancellation until dropped.
    #[must_use]
    pub fn drain_guard(&self) -> DrainGuard {
        self.inner.draining.fetch_add(1, Ordering::AcqRel);
        DrainGuard {
            token: self.clone(),
        }
    }

    /// Returns `true` while any drain guard is held.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire) > 0
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[derive(Debug)]
pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = CancelReason;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CancelReason> {
        self.token.poll_cancelled(cx)
    }
}

/// Guard returned by [`CancelToken::drain_guard`].
#[derive(Debug)]
pub struct DrainGuard {
    token: CancelToken,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.token.inner.draining.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelKind;
    use std::sync::atomic::AtomicBool;
    use std::task::Wake;

    struct Flag(AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_wakes_registered_waker_once() {
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let token = CancelToken::new();

        assert!(token.register(&waker));
        assert!(token.register(&waker));
        assert!(token.cancel(CancelReason::user("stop")));
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(!token.register(&waker));
    }

    #[test]
    fn second_cancel_strengthens() {
        let token = CancelToken::new();
        assert!(token.cancel(CancelReason::user("a")));
        assert!(!token.cancel(CancelReason::shutdown()));
        assert_eq!(token.reason().map(|r| r.kind), Some(CancelKind::Shutdown));
    }

    #[test]
    fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.cancel(CancelReason::parent_cancelled());
        });
        let reason = futures_lite::future::block_on(token.cancelled());
        assert_eq!(reason.kind, CancelKind::ParentCancelled);
    }

    #[test]
    fn drain_guards_count() {
        let token = CancelToken::new();
        assert!(!token.is_draining());
        let a = token.drain_guard();
        let b = token.drain_guard();
        drop(a);
        assert!(token.is_draining());
        drop(b);
        assert!(!token.is_draining());
    }
}
