//! Execution frames and context snapshots.
//!
//! Every piece of code runs inside a *frame*:
//!
//! - each OS thread has a root frame, created lazily and dropped with the
//!   thread
//! - the event loop installs the polled task's frame around every poll and
//!   around the drop of the task's future
//! - a bridge crossing installs a frame built from the caller's snapshot
//!   while the callee runs on another thread
//!
//! A frame holds a [`ContextSnapshot`] (shared, copy-on-write, crosses the
//! bridge) and optionally a pinned map (thread-critical values, never
//! crosses the bridge). Crossing frames carry no pinned map, so
//! thread-critical lookups inside them fall through to the thread's root.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::types::LocalId;

/// A value stored in a [`Local`](super::Local).
pub type LocalValue = Arc<dyn Any + Send + Sync>;

pub(crate) type Attributes = HashMap<String, LocalValue>;
pub(crate) type PinnedMap = HashMap<LocalId, Attributes>;

type Extension = Arc<dyn Any + Send + Sync>;

/// An immutable copy of the context-local state of one frame.
///
/// Cloning is cheap; modifications copy only the touched store.
#[derive(Clone, Default)]
pub struct ContextSnapshot {
    locals: Arc<HashMap<LocalId, Arc<Attributes>>>,
    extensions: Arc<HashMap<TypeId, Extension>>,
}

impl ContextSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no local store has ever been written in this
    /// snapshot's lineage.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Number of local stores with entries.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.locals.len()
    }

    pub(crate) fn get(&self, local: LocalId, name: &str) -> Option<LocalValue> {
        self.locals.get(&local)?.get(name).cloned()
    }

    pub(crate) fn set(
        &mut self,
        local: LocalId,
        name: String,
        value: LocalValue,
    ) -> Option<LocalValue> {
        let attrs = Arc::make_mut(&mut self.locals).entry(local).or_default();
        Arc::make_mut(attrs).insert(name, value)
    }

    pub(crate) fn remove(&mut self, local: LocalId, name: &str) -> Option<LocalValue> {
        if !self.locals.get(&local)?.contains_key(name) {
            return None;
        }
        let attrs = Arc::make_mut(&mut self.locals).get_mut(&local)?;
        Arc::make_mut(attrs).remove(name)
    }

    pub(crate) fn extension<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions
            .get(&TypeId::of::<T>())?
            .downcast_ref::<T>()
            .cloned()
    }

    pub(crate) fn set_extension<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.extensions).insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Copies every local store that differs in `callee` over this snapshot.
    ///
    /// Stores are replaced as a unit, so attributes the callee deleted are
    /// deleted here too. Bridge-internal extensions are not merged.
    pub(crate) fn merge_locals_from(&mut self, callee: &Self) {
        if Arc::ptr_eq(&self.locals, &callee.locals) {
            return;
        }
        let changed: Vec<(LocalId, Arc<Attributes>)> = callee
            .locals
            .iter()
            .filter(|(id, attrs)| {
                self.locals
                    .get(id)
                    .map_or(true, |mine| !Arc::ptr_eq(mine, attrs))
            })
            .map(|(id, attrs)| (*id, Arc::clone(attrs)))
            .collect();
        if changed.is_empty() {
            return;
        }
        let locals = Arc::make_mut(&mut self.locals);
        for (id, attrs) in changed {
            locals.insert(id, attrs);
        }
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("stores", &self.locals.len())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// Storage installed for the duration of a task poll or a crossing.
pub(crate) struct Frame {
    shared: Mutex<ContextSnapshot>,
    pinned: Option<Mutex<PinnedMap>>,
}

impl Frame {
    /// A frame owning thread-critical state (thread roots and loop tasks).
    pub(crate) fn pinned(snapshot: ContextSnapshot, pinned: PinnedMap) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(snapshot),
            pinned: Some(Mutex::new(pinned)),
        })
    }

    /// A frame for a callee running on behalf of another context.
    pub(crate) fn crossing(snapshot: ContextSnapshot) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(snapshot),
            pinned: None,
        })
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        self.shared.lock().clone()
    }

    /// Mutates the shared snapshot. The returned value is dropped by the
    /// caller after the lock is released.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ContextSnapshot) -> R) -> R {
        f(&mut self.shared.lock())
    }

    pub(crate) fn replace(&self, snapshot: ContextSnapshot) -> ContextSnapshot {
        std::mem::replace(&mut *self.shared.lock(), snapshot)
    }

    pub(crate) fn pinned_copy(&self) -> PinnedMap {
        self.pinned
            .as_ref()
            .map(|p| p.lock().clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pinned", &self.pinned.is_some())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static ROOT: Arc<Frame> = Frame::pinned(ContextSnapshot::default(), PinnedMap::new());
    static STACK: RefCell<Vec<Arc<Frame>>> = const { RefCell::new(Vec::new()) };
}

fn root_frame() -> Arc<Frame> {
    // During thread teardown the root may already be gone; a detached frame
    // keeps late accesses well-defined.
    ROOT.try_with(Arc::clone)
        .unwrap_or_else(|_| Frame::pinned(ContextSnapshot::default(), PinnedMap::new()))
}

/// The innermost frame on this thread.
pub(crate) fn current_frame() -> Arc<Frame> {
    STACK
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten()
        .unwrap_or_else(root_frame)
}

/// The innermost frame on this thread that owns thread-critical state.
pub(crate) fn pinned_frame() -> Arc<Frame> {
    STACK
        .try_with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|frame| frame.pinned.is_some())
                .cloned()
        })
        .ok()
        .flatten()
        .unwrap_or_else(root_frame)
}

/// Runs `f` against the thread-critical map of the innermost pinned frame.
pub(crate) fn with_pinned<R>(f: impl FnOnce(&mut PinnedMap) -> R) -> R {
    let frame = pinned_frame();
    match frame.pinned.as_ref() {
        Some(pinned) => f(&mut pinned.lock()),
        None => f(&mut PinnedMap::new()),
    }
}

/// Installs `frame` as the innermost frame until the guard drops.
pub(crate) fn enter(frame: Arc<Frame>) -> FrameGuard {
    STACK.with(|stack| stack.borrow_mut().push(frame));
    FrameGuard {
        _not_send: PhantomData,
    }
}

/// Pops the frame pushed by [`enter`].
#[must_use = "the frame is popped when the guard drops"]
pub(crate) struct FrameGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let popped = STACK.try_with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

/// Captures the calling frame's context.
#[must_use]
pub fn capture() -> ContextSnapshot {
    current_frame().snapshot()
}

/// Runs `f` inside a crossing frame built from `snapshot` and returns its
/// result together with the frame's final snapshot.
pub(crate) fn run_in<R>(snapshot: ContextSnapshot, f: impl FnOnce() -> R) -> (R, ContextSnapshot) {
    let frame = Frame::crossing(snapshot);
    let result = {
        let _guard = enter(Arc::clone(&frame));
        f()
    };
    (result, frame.snapshot())
}

/// Applies a callee's final snapshot to the calling frame.
pub(crate) fn merge_into_current(callee: &ContextSnapshot) {
    let frame = current_frame();
    let previous = frame.update(|mine| {
        let previous = mine.clone();
        mine.merge_locals_from(callee);
        previous
    });
    drop(previous);
}
