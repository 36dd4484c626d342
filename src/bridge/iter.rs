//! Blocking iterators as async streams.
//!
//! Each item is produced by calling `next()` on a worker thread through
//! [`SyncToAsync`], so a blocking iterator (a cursor, a file reader) can be
//! consumed from async code without stalling the loop. The iterator moves
//! to the worker for every step and back to the stream afterwards.
//!
//! Iterators that must be created where they are used (a database cursor
//! bound to its connection thread) can be built lazily with
//! [`iter_fn_to_stream`]; the builder then runs as part of the first step.

use futures_lite::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::sync_to_async::SyncToAsync;
use super::Bridge;
use crate::error::Result;

type Step<I> = (I, Option<<I as Iterator>::Item>);
type MakeIter<I> = Box<dyn FnOnce() -> I + Send>;
type StepFuture<I> = Pin<Box<dyn Future<Output = Result<Step<I>>> + Send>>;

/// Streams `iter` through the process default bridge.
///
/// Steps run on the default pool; use
/// [`SyncIterStream::thread_sensitive`] to run them on the thread-sensitive
/// slot instead.
pub fn iter_to_stream<I>(iter: I) -> SyncIterStream<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    Bridge::global().iter_to_stream(iter)
}

/// Streams the iterator returned by `make` through the process default bridge.
///
/// `make` runs on the same executor as the steps.
pub fn iter_fn_to_stream<I, M>(make: M) -> SyncIterStream<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
    M: FnOnce() -> I + Send + 'static,
{
    Bridge::global().iter_fn_to_stream(make)
}

enum Source<I> {
    Built(I),
    Unbuilt(MakeIter<I>),
}

fn advance<I: Iterator>(source: Source<I>) -> Step<I> {
    let mut iter = match source {
        Source::Built(iter) => iter,
        Source::Unbuilt(make) => make(),
    };
    let item = iter.next();
    (iter, item)
}

enum State<I: Iterator> {
    Idle(Source<I>),
    Stepping(StepFuture<I>),
    Done,
}

/// A [`Stream`] over a blocking iterator.
///
/// Yields `Ok(item)` per item. A bridge failure (such as cancellation) is
/// yielded once as `Err` and ends the stream.
pub struct SyncIterStream<I: Iterator> {
    state: State<I>,
    step: SyncToAsync<fn(Source<I>) -> Step<I>>,
}

impl<I> SyncIterStream<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    pub(crate) fn new(bridge: Bridge, iter: I) -> Self {
        Self::from_source(bridge, Source::Built(iter))
    }

    pub(crate) fn lazy<M>(bridge: Bridge, make: M) -> Self
    where
        M: FnOnce() -> I + Send + 'static,
    {
        Self::from_source(bridge, Source::Unbuilt(Box::new(make)))
    }

    fn from_source(bridge: Bridge, source: Source<I>) -> Self {
        let step: fn(Source<I>) -> Step<I> = advance::<I>;
        Self {
            state: State::Idle(source),
            step: SyncToAsync::new(bridge, step)
                .thread_sensitive(false)
                .named(std::any::type_name::<I>()),
        }
    }

    /// Advances the iterator on the thread-sensitive slot instead of a pool.
    #[must_use]
    pub fn thread_sensitive(mut self, enabled: bool) -> Self {
        self.step = self.step.thread_sensitive(enabled);
        self
    }
}

// The iterator is only ever moved, never pinned.
impl<I: Iterator> Unpin for SyncIterStream<I> {}

impl<I> Stream for SyncIterStream<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = Result<I::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, State::Done) {
                State::Idle(source) => {
                    this.state = State::Stepping(Box::pin(this.step.call(source)));
                }
                State::Stepping(mut step) => {
                    return match step.as_mut().poll(cx) {
                        Poll::Pending => {
                            this.state = State::Stepping(step);
                            Poll::Pending
                        }
                        Poll::Ready(Ok((iter, Some(item)))) => {
                            this.state = State::Idle(Source::Built(iter));
                            Poll::Ready(Some(Ok(item)))
                        }
                        Poll::Ready(Ok((_, None))) => Poll::Ready(None),
                        Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
                    };
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<I: Iterator> fmt::Debug for SyncIterStream<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Idle(Source::Unbuilt(_)) => "unbuilt",
            State::Idle(Source::Built(_)) => "idle",
            State::Stepping(_) => "stepping",
            State::Done => "done",
        };
        f.debug_struct("SyncIterStream")
            .field("state", &state)
            .field("step", &self.step)
            .finish()
    }
}
