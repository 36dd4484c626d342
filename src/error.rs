//! Error types for bridge operations.
//!
//! Only failures of the bridge itself are reported through [`Error`]:
//!
//! - **Usage**: an adapter was invoked from a context it cannot serve
//! - **Deadlock**: a thread-sensitive call would wait on its own slot
//! - **Cancellation**: the crossing ended without a value
//! - **Lookup**: a context-local attribute is absent
//! - **Runtime**: event loop or executor state prevents the crossing
//! - **Config**: configuration could not be loaded or validated
//! - **Internal**: bridge bugs and invalid states
//!
//! Callee results are never wrapped. A callee's own `Result` is delivered
//! untouched as the adapter's value and a callee panic is resumed on the
//! caller.

use core::fmt;
use std::sync::Arc;

use crate::types::{CancelReason, LoopId, TaskId};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Usage ===
    /// An adapter was used from the wrong kind of context.
    Usage,

    // === Deadlock ===
    /// A thread-sensitive call would block on work it is itself holding up.
    Deadlock,

    // === Cancellation ===
    /// The crossing was cancelled.
    Cancelled,

    // === Lookup ===
    /// A context-local attribute was read or deleted but is not set.
    NotFound,

    // === Runtime ===
    /// No event loop is running on the current thread.
    NoRunningLoop,
    /// The target event loop has already shut down.
    LoopClosed,
    /// Every idle executor in the chain has stopped accepting work.
    ExecutorBroken,

    // === Config ===
    /// Configuration is invalid or could not be loaded.
    Config,

    // === Internal ===
    /// Internal bridge error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Usage => ErrorCategory::Usage,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::NotFound => ErrorCategory::Lookup,
            Self::NoRunningLoop | Self::LoopClosed | Self::ExecutorBroken => {
                ErrorCategory::Runtime
            }
            Self::Config => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::LoopClosed | Self::ExecutorBroken => Recoverability::Transient,
            Self::Usage | Self::Deadlock | Self::Config | Self::Internal => {
                Recoverability::Permanent
            }
            Self::Cancelled | Self::NotFound | Self::NoRunningLoop => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }

    /// Returns the recommended recovery action for this error kind.
    #[must_use]
    pub const fn recovery_action(&self) -> RecoveryAction {
        match self {
            Self::LoopClosed | Self::ExecutorBroken => RecoveryAction::RetryImmediately,
            Self::Cancelled | Self::NotFound | Self::NoRunningLoop => RecoveryAction::Propagate,
            Self::Usage | Self::Deadlock | Self::Config => RecoveryAction::FixCaller,
            Self::Internal => RecoveryAction::Escalate,
        }
    }
}

/// Classification of error recoverability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary condition; retrying the crossing may succeed.
    Transient,
    /// Retrying the same call from the same context fails again.
    Permanent,
    /// Depends on what the caller does next.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// Recommended recovery action for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// Retry the crossing; a fresh loop or executor is picked up.
    RetryImmediately,
    /// Propagate the error to the caller.
    Propagate,
    /// The calling code must be changed (wrong context, self-deadlock, bad config).
    FixCaller,
    /// Report as a bug.
    Escalate,
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Adapter misuse.
    Usage,
    /// Thread-sensitive self-deadlock.
    Deadlock,
    /// Cancellation-related failures.
    Cancellation,
    /// Context-local lookups.
    Lookup,
    /// Event loop and executor state.
    Runtime,
    /// Configuration failures.
    Config,
    /// Internal bridge errors.
    Internal,
}

/// Diagnostic context for an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// The task that was being polled when the error was raised.
    pub task_id: Option<TaskId>,
    /// The event loop involved.
    pub loop_id: Option<LoopId>,
    /// The name of the callable being bridged.
    pub callable: Option<String>,
}

/// The main error type for bridge operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    context: ErrorContext,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            context: ErrorContext {
                task_id: None,
                loop_id: None,
                callable: None,
            },
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports adapter misuse.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self.kind, ErrorKind::Usage)
    }

    /// Returns true if this error is a thread-sensitive self-deadlock.
    #[must_use]
    pub const fn is_deadlock(&self) -> bool {
        matches!(self.kind, ErrorKind::Deadlock)
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a missing context-local attribute.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds structured context to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        self.context = ctx;
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(format!("{reason}"))
    }

    /// Creates a usage error.
    #[must_use]
    pub fn usage(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage).with_message(detail)
    }

    /// Creates a deadlock error for the named callable.
    #[must_use]
    pub fn deadlock(callable: &str) -> Self {
        Self::new(ErrorKind::Deadlock)
            .with_message(format!(
                "single thread executor already being used by {callable}, would deadlock"
            ))
            .with_context(ErrorContext {
                callable: Some(callable.to_owned()),
                ..ErrorContext::default()
            })
    }

    /// Creates a not-found error for a context-local attribute.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorKind::NotFound).with_message(format!("attribute {name:?} is not set"))
    }

    /// Creates an internal error (bridge bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the recommended recovery action for this error.
    #[must_use]
    pub const fn recovery_action(&self) -> RecoveryAction {
        self.kind.recovery_action()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the error context.
    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Records where a bridge failure happened.
///
/// Each method fills its field only when it is still empty, so the site
/// closest to the failure wins.
pub trait ResultExt<T> {
    /// Names the bridged callable.
    fn for_callable(self, name: &str) -> Result<T>;
    /// Records the event loop.
    fn on_loop(self, loop_id: LoopId) -> Result<T>;
    /// Records the task that was crossing, if any.
    fn in_task(self, task_id: Option<TaskId>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn for_callable(self, name: &str) -> Result<T> {
        self.map_err(|err| {
            let mut err = err.into();
            if err.context.callable.is_none() {
                err.context.callable = Some(name.to_owned());
            }
            err
        })
    }

    fn on_loop(self, loop_id: LoopId) -> Result<T> {
        self.map_err(|err| {
            let mut err = err.into();
            err.context.loop_id.get_or_insert(loop_id);
            err
        })
    }

    fn in_task(self, task_id: Option<TaskId>) -> Result<T> {
        self.map_err(|err| {
            let mut err = err.into();
            if err.context.task_id.is_none() {
                err.context.task_id = task_id;
            }
            err
        })
    }
}

/// A specialized Result type for bridge operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_message() {
        let err = Error::usage("called from a running loop");
        assert_eq!(err.to_string(), "Usage: called from a running loop");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::Config)
            .with_message("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new(ErrorKind::Usage).is_usage());
        assert!(Error::deadlock("f").is_deadlock());
        assert!(Error::cancelled(&CancelReason::shutdown()).is_cancelled());
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::new(ErrorKind::LoopClosed).is_usage());
    }

    #[test]
    fn deadlock_records_callable() {
        let err = Error::deadlock("my_module::handler");
        assert_eq!(err.context().callable.as_deref(), Some("my_module::handler"));
        assert!(err.message().unwrap().contains("would deadlock"));
    }

    #[test]
    fn categories_and_recovery() {
        assert_eq!(ErrorKind::NoRunningLoop.category(), ErrorCategory::Runtime);
        assert_eq!(ErrorKind::NotFound.category(), ErrorCategory::Lookup);
        assert!(ErrorKind::LoopClosed.is_retryable());
        assert!(ErrorKind::Deadlock.recoverability().is_permanent());
        assert_eq!(ErrorKind::Usage.recovery_action(), RecoveryAction::FixCaller);
        assert_eq!(ErrorKind::Internal.recovery_action(), RecoveryAction::Escalate);
    }

    #[test]
    fn result_ext_keeps_the_innermost_context() {
        let res: core::result::Result<(), Error> = Err(Error::deadlock("inner"));
        let loop_id = LoopId::new_for_test(3);
        let task_id = TaskId::new_for_test(9);
        let err = res
            .for_callable("outer")
            .on_loop(loop_id)
            .in_task(Some(task_id))
            .in_task(None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);
        assert_eq!(err.context().callable.as_deref(), Some("inner"));
        assert_eq!(err.context().loop_id, Some(loop_id));
        assert_eq!(err.context().task_id, Some(task_id));
    }

    #[test]
    fn result_ext_converts_foreign_errors() {
        let res: core::result::Result<(), crate::config::ConfigError> =
            Err(crate::config::ConfigError::Invalid {
                field: "idle_timeout",
                reason: "must be non-zero",
            });
        let err = res.for_callable("loader").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.context().callable.as_deref(), Some("loader"));
    }
}
