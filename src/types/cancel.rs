//! Cancellation reason and kind types.
//!
//! A crossing that ends because someone asked it to stop carries a
//! [`CancelReason`] so that the side observing the cancellation can tell why
//! the work never produced a value.

use core::fmt;

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code (`JoinHandle::cancel`,
    /// `CancelToken::cancel`).
    User,
    /// The awaiting side of a crossing was cancelled and the cancellation was
    /// forwarded to the nested task it launched.
    ParentCancelled,
    /// Queued work was dropped because the executor that owned it stopped
    /// idling and no live predecessor could take it over.
    Abandoned,
    /// The event loop closed while the task was still pending.
    Shutdown,
}

impl CancelKind {
    /// Returns the severity of this cancellation kind.
    ///
    /// Higher severity cancellations take precedence when strengthening.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::User => 0,
            Self::ParentCancelled => 1,
            Self::Abandoned => 2,
            Self::Shutdown => 3,
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation, including kind and optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// Creates a new cancellation reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// Creates a parent-cancelled reason.
    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    /// Creates an abandoned-work reason.
    #[must_use]
    pub const fn abandoned() -> Self {
        Self::new(CancelKind::Abandoned)
    }

    /// Creates a shutdown cancellation reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Strengthens this reason with another, keeping the more severe one.
    ///
    /// Returns `true` if the reason was changed.
    pub fn strengthen(&mut self, other: &Self) -> bool {
        if other.kind > self.kind {
            self.kind = other.kind;
            self.message = other.message;
            return true;
        }
        if other.kind < self.kind {
            return false;
        }
        match (self.message, other.message) {
            (None, Some(msg)) => {
                self.message = Some(msg);
                true
            }
            (Some(current), Some(candidate)) if candidate < current => {
                self.message = Some(candidate);
                true
            }
            _ => false,
        }
    }

    /// Returns true if this reason indicates loop shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }

    /// Returns the kind of this cancellation reason.
    #[must_use]
    pub const fn kind(&self) -> CancelKind {
        self.kind
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(CancelKind::User.severity() < CancelKind::ParentCancelled.severity());
        assert!(CancelKind::ParentCancelled.severity() < CancelKind::Abandoned.severity());
        assert!(CancelKind::Abandoned.severity() < CancelKind::Shutdown.severity());
    }

    #[test]
    fn strengthen_takes_more_severe() {
        let mut reason = CancelReason::new(CancelKind::User);
        assert!(reason.strengthen(&CancelReason::parent_cancelled()));
        assert_eq!(reason.kind, CancelKind::ParentCancelled);

        assert!(reason.strengthen(&CancelReason::shutdown()));
        assert_eq!(reason.kind, CancelKind::Shutdown);

        assert!(!reason.strengthen(&CancelReason::abandoned()));
        assert_eq!(reason.kind, CancelKind::Shutdown);
    }

    #[test]
    fn strengthen_same_kind_picks_smallest_message() {
        let mut reason = CancelReason::user("b");
        assert!(reason.strengthen(&CancelReason::user("a")));
        assert_eq!(reason.message, Some("a"));
        assert!(!reason.strengthen(&CancelReason::user("c")));
    }

    #[test]
    fn display_includes_message() {
        assert_eq!(CancelReason::user("stop").to_string(), "user: stop");
        assert_eq!(CancelReason::shutdown().to_string(), "shutdown");
    }
}
