//! Syncbridge: call blocking code from async code and async code from
//! blocking code, without losing thread affinity or context.
//!
//! # Overview
//!
//! Programs that mix a cooperative event loop with blocking libraries need
//! two crossings. [`sync_to_async`] wraps a blocking callable so async code
//! can await it while it runs on a worker thread. [`async_to_sync`] wraps an
//! async callable so blocking code can call it and wait for the result.
//!
//! Crossings nest arbitrarily, and the bridge keeps three promises across
//! every level:
//!
//! - **Thread affinity**: thread-sensitive sync work runs on the outermost
//!   blocking thread when there is one, inside a [`ThreadSensitiveContext`]
//!   when one is open, and on a single process-wide worker otherwise
//! - **Context propagation**: [`Local`] values set on either side of a
//!   crossing are visible on the other side and flow back when it returns
//! - **Cancellation containment**: cancelling an awaiting task never tears
//!   a sync callee down halfway; the caller resolves once the callee has
//!   finished or been withdrawn
//!
//! # Module Structure
//!
//! - [`bridge`]: the two adapters, scopes, iterator streaming and the
//!   affinity registry
//! - [`local`]: context-local storage that crosses the bridge
//! - [`runtime`]: the event loop, worker pools and idle executors
//! - [`config`]: bridge configuration from code, environment or TOML
//! - [`types`]: identifiers, outcomes and cancellation reasons
//! - [`error`]: error types
//! - [`tracing_compat`]: logging macros that compile away without the
//!   `tracing-integration` feature
//!
//! # Example
//!
//! ```
//! use syncbridge::runtime::EventLoop;
//! use syncbridge::{async_to_sync, sync_to_async};
//!
//! let double = sync_to_async(|x: u32| {
//!     // A blocking callee may call back into async code.
//!     async_to_sync(|y: u32| async move { y * 2 }).call(x).unwrap()
//! });
//! let answer = EventLoop::block_on(double.call(21)).unwrap().unwrap();
//! assert_eq!(answer, 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod local;
pub mod runtime;
pub mod tracing_compat;
pub mod types;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use bridge::{
    async_to_sync, iter_fn_to_stream, iter_to_stream, sync_to_async, AffinityRegistry,
    AsyncToSync, Bridge, BridgeBuilder, LaunchRecord, RegistryStats, SyncIterStream, SyncToAsync,
    ThreadSensitiveContext,
};
pub use config::{BridgeConfig, ConfigError};
pub use error::{
    Error, ErrorCategory, ErrorContext, ErrorKind, Recoverability, RecoveryAction, Result,
    ResultExt,
};
pub use local::{capture, ContextSnapshot, Local, LocalValue};
pub use types::{
    CancelKind, CancelReason, ExecutorId, LocalId, LoopId, Outcome, PanicPayload, ScopeId,
    TaskId,
};
