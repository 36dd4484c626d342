//! Three-valued outcome of a crossing.
//!
//! - `Ok(T)`: the callee returned a value (which may itself be a `Result`)
//! - `Cancelled(CancelReason)`: the callee never produced a value
//! - `Panicked(PanicPayload)`: the callee panicked
//!
//! These form a severity lattice: `Ok < Cancelled < Panicked`. Callee errors
//! are values and ride inside `Ok` untouched.

use super::cancel::CancelReason;
use crate::error::{Error, ErrorKind};
use core::fmt;
use std::any::Any;

/// Payload from a caught panic.
///
/// Keeps the original boxed value so that resuming the unwind on the other
/// side of a crossing re-raises exactly what the callee raised.
pub struct PanicPayload {
    payload: Box<dyn Any + Send + 'static>,
}

impl PanicPayload {
    /// Wraps a payload obtained from `std::panic::catch_unwind`.
    #[must_use]
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self { payload }
    }

    /// Returns the panic message when the payload is a string.
    #[must_use]
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "<non-string panic payload>"
        }
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }

    /// Re-raises the panic on the current thread.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload")
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message())
    }
}

/// The outcome of a crossing.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The callee produced a value.
    Ok(T),
    /// The crossing was cancelled before a value was produced.
    Cancelled(CancelReason),
    /// The callee panicked.
    Panicked(PanicPayload),
}

impl<T> Outcome<T> {
    /// Returns the severity level of this outcome (0 = Ok, 2 = Panicked).
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Ok(_) => 0,
            Self::Cancelled(_) => 1,
            Self::Panicked(_) => 2,
        }
    }

    /// Returns true if this outcome is `Ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true if this outcome is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns true if this outcome is `Panicked`.
    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Maps the success value using the provided function.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Ok(v) => Outcome::Ok(f(v)),
            Self::Cancelled(r) => Outcome::Cancelled(r),
            Self::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Converts the outcome into the value a bridge caller sees.
    ///
    /// Cancellation becomes an [`ErrorKind::Cancelled`] error.
    ///
    /// # Panics
    ///
    /// Resumes the callee's panic when the outcome is `Panicked`.
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Cancelled(r) => {
                Err(Error::new(ErrorKind::Cancelled).with_message(r.to_string()))
            }
            Self::Panicked(p) => p.resume(),
        }
    }
}
