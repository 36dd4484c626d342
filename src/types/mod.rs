//! Core types shared by the runtime and the bridge.
//!
//! - [`id`]: Identifier types (`TaskId`, `LoopId`, `ScopeId`, `LocalId`, `ExecutorId`)
//! - [`outcome`]: Three-valued outcome type with severity lattice
//! - [`cancel`]: Cancellation reason and kind types

pub mod cancel;
pub mod id;
pub mod outcome;

pub use cancel::{CancelKind, CancelReason};
pub use id::{ExecutorId, LocalId, LoopId, ScopeId, TaskId};
pub use outcome::{Outcome, PanicPayload};
