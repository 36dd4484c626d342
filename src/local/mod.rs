//! Context-local storage that follows execution across the bridge.
//!
//! A [`Local`] is a namespace of named attributes whose values depend on
//! where they are read:
//!
//! - inside a loop task, values are local to the task and are inherited (as
//!   a copy) by tasks it spawns
//! - on a thread with no task running, values are local to the thread
//! - a sync callee run through [`sync_to_async`](crate::sync_to_async) sees
//!   the awaiting task's values, and its writes are visible to the task
//!   after the call returns; [`async_to_sync`](crate::async_to_sync) does the
//!   same in the other direction
//!
//! A *thread-critical* local never crosses the bridge. On a sync thread it
//! behaves like a plain thread-local; inside a loop task it is local to that
//! task on that thread.
//!
//! ```
//! use syncbridge::Local;
//!
//! let request = Local::new();
//! request.set("user", String::from("alice"));
//! assert_eq!(request.get_as::<String>("user").unwrap(), "alice");
//! request.delete("user").unwrap();
//! assert!(request.get("user").unwrap_err().is_not_found());
//! ```

pub mod context;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub use context::{capture, ContextSnapshot, LocalValue};

use crate::error::{Error, Result};
use crate::types::LocalId;

/// A namespace of context-local attributes.
pub struct Local {
    id: LocalId,
    thread_critical: bool,
}

impl Local {
    /// Creates a local whose values follow execution across the bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: LocalId::next(),
            thread_critical: false,
        }
    }

    /// Creates a local whose values stay on the thread that set them.
    #[must_use]
    pub fn thread_critical() -> Self {
        Self {
            id: LocalId::next(),
            thread_critical: true,
        }
    }

    /// Returns `true` for thread-critical locals.
    #[must_use]
    pub const fn is_thread_critical(&self) -> bool {
        self.thread_critical
    }

    /// Returns the attribute, or a `NotFound` error if it is not set in the
    /// calling context.
    pub fn get(&self, name: &str) -> Result<LocalValue> {
        self.try_get(name).ok_or_else(|| Error::not_found(name))
    }

    /// Returns a clone of the attribute as `T`.
    ///
    /// Fails with `NotFound` when unset and `Usage` when the stored value has
    /// a different type.
    pub fn get_as<T>(&self, name: &str) -> Result<T>
    where
        T: Any + Clone,
    {
        let value = self.get(name)?;
        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            Error::usage(format!(
                "attribute {name:?} does not hold a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Returns the attribute if set.
    #[must_use]
    pub fn try_get(&self, name: &str) -> Option<LocalValue> {
        if self.thread_critical {
            context::with_pinned(|map| map.get(&self.id)?.get(name).cloned())
        } else {
            context::current_frame().snapshot().get(self.id, name)
        }
    }

    /// Returns `true` if the attribute is set in the calling context.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.try_get(name).is_some()
    }

    /// Sets the attribute in the calling context.
    pub fn set<V>(&self, name: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        let name = name.into();
        let value: LocalValue = Arc::new(value);
        let previous = if self.thread_critical {
            context::with_pinned(|map| map.entry(self.id).or_default().insert(name, value))
        } else {
            context::current_frame().update(|snapshot| snapshot.set(self.id, name, value))
        };
        drop(previous);
    }

    /// Removes the attribute from the calling context.
    ///
    /// Fails with `NotFound` if it is not set.
    pub fn delete(&self, name: &str) -> Result<()> {
        let removed = if self.thread_critical {
            context::with_pinned(|map| map.get_mut(&self.id)?.remove(name))
        } else {
            context::current_frame().update(|snapshot| snapshot.remove(self.id, name))
        };
        removed.map(drop).ok_or_else(|| Error::not_found(name))
    }
}

impl Default for Local {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Local")
            .field("id", &self.id)
            .field("thread_critical", &self.thread_critical)
            .finish()
    }
}
