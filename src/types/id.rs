//! Identifier types for bridge entities.
//!
//! Every identifier is a process-unique `u64` drawn from its own monotonic
//! counter. Identifiers are never reused, so a stale id can never alias a
//! live entity.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next identifier.
            #[must_use]
            pub(crate) fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Creates an identifier for testing purposes.
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw numeric value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// A unique identifier for a task scheduled on an event loop.
    TaskId,
    TASK_COUNTER,
    "T"
);

define_id!(
    /// A unique identifier for an event loop.
    LoopId,
    LOOP_COUNTER,
    "L"
);

define_id!(
    /// A unique identifier for an open thread-sensitivity scope.
    ScopeId,
    SCOPE_COUNTER,
    "S"
);

define_id!(
    /// A unique identifier for a context-local store.
    LocalId,
    LOCAL_COUNTER,
    "V"
);

define_id!(
    /// A unique identifier for an idle executor.
    ExecutorId,
    EXECUTOR_COUNTER,
    "E"
);
