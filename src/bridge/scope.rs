//! Thread-sensitivity scopes.
//!
//! Inside a [`ThreadSensitiveContext`], thread-sensitive `sync_to_async`
//! calls made by the entering task (and by tasks it spawns) run on a worker
//! dedicated to the scope instead of the bridge-wide single-thread slot.
//! Independent requests can then each keep their sync work on one thread
//! without queueing behind each other.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{Bridge, BridgeState};
use crate::error::Result;
use crate::local::context::{self, Frame};
use crate::runtime::current_loop;
use crate::tracing_compat::debug;
use crate::types::ScopeId;

/// An open thread-sensitivity scope.
///
/// Scopes nest: entering while a scope is already open in the current
/// context reuses the outer scope, and only the outermost guard closes it.
/// A scope id inherited after its owner closed it is not reused.
///
/// Closing clears the scope from the context the guard was entered in,
/// wherever the guard is dropped.
pub struct ThreadSensitiveContext {
    bridge: Bridge,
    id: ScopeId,
    /// The entering context, held by the outermost guard only.
    owner: Option<Arc<Frame>>,
}

impl ThreadSensitiveContext {
    /// Opens a scope on the process default bridge.
    ///
    /// Must be called from an event loop task; fails with `NoRunningLoop`
    /// elsewhere.
    pub fn enter() -> Result<Self> {
        Self::enter_with(Bridge::global())
    }

    /// Opens a scope on `bridge`.
    pub fn enter_with(bridge: &Bridge) -> Result<Self> {
        current_loop()?;
        let inherited = BridgeState::current()
            .scope
            .filter(|id| bridge.scope_pool(*id).is_some());
        if let Some(id) = inherited {
            return Ok(Self {
                bridge: bridge.clone(),
                id,
                owner: None,
            });
        }
        let id = ScopeId::next();
        bridge.open_scope(id);
        let frame = context::current_frame();
        BridgeState::update_in(&frame, |state| state.scope = Some(id));
        debug!(scope = %id, "thread-sensitive scope entered");
        Ok(Self {
            bridge: bridge.clone(),
            id,
            owner: Some(frame),
        })
    }

    /// Runs `future` inside a scope on the process default bridge.
    pub fn run<Fut: Future>(future: Fut) -> impl Future<Output = Result<Fut::Output>> {
        Self::run_with(Bridge::global(), future)
    }

    /// Runs `future` inside a scope on `bridge`.
    pub fn run_with<Fut: Future>(
        bridge: &Bridge,
        future: Fut,
    ) -> impl Future<Output = Result<Fut::Output>> {
        let bridge = bridge.clone();
        async move {
            let scope = Self::enter_with(&bridge)?;
            let output = future.await;
            scope.exit();
            Ok(output)
        }
    }

    /// The id of the scope in effect.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Returns `true` if this guard opened the scope.
    #[must_use]
    pub fn is_outermost(&self) -> bool {
        self.owner.is_some()
    }

    /// Closes the scope now. Equivalent to dropping the guard.
    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for ThreadSensitiveContext {
    fn drop(&mut self) {
        let Some(frame) = self.owner.take() else {
            return;
        };
        let id = self.id;
        BridgeState::update_in(&frame, |state| {
            if state.scope == Some(id) {
                state.scope = None;
            }
        });
        self.bridge.close_scope(id);
        debug!(scope = %id, "thread-sensitive scope exited");
    }
}

impl fmt::Debug for ThreadSensitiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSensitiveContext")
            .field("id", &self.id)
            .field("outermost", &self.is_outermost())
            .finish()
    }
}
