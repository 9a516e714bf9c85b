//! Failure Channel
//!
//! This module defines the error payload carried by the effect algebra.
//!
//! # Design
//!
//! Every failure that travels through the runtime is representable as data:
//! user errors raised inside thunks, the distinguished cancellation
//! condition, and composite failures where a cleanup action failed while an
//! earlier failure was already in flight. Panics inside thunks are caught at
//! the interpreter boundary and reified into the user-error arm, so a broken
//! computation never unwinds through the run loop.
//!
//! Protocol violations (settling a completion cell twice) are a separate
//! category: they are raised through the normal channel as [`AlreadySettled`]
//! so callers can observe them, but they indicate a broken invariant rather
//! than business logic and are never produced by a correct program.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// The failure payload of an effect.
///
/// `Failure` is cheap to clone; the raised arm shares the underlying error
/// through an `Arc`.
#[derive(Debug, Clone)]
pub enum Failure {
    /// A user error raised inside a thunk, callback, or via `raise_error`.
    Raised(Arc<dyn Error + Send + Sync + 'static>),
    /// The distinguished cancellation condition.
    ///
    /// Produced when the run loop observes its cancel connection between
    /// trampoline steps. Supersedes any in-flight success or error.
    Canceled,
    /// Two simultaneous failures, e.g. a `use` error plus a `release` error.
    ///
    /// The first field is the primary failure, the second the suppressed one.
    Both(Box<Failure>, Box<Failure>),
}

impl Failure {
    /// Wrap a concrete error into the raised arm.
    pub fn raised<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Failure::Raised(Arc::new(error))
    }

    /// Raise a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Failure::raised(Message(message.into()))
    }

    /// Compose a primary failure with a suppressed secondary one.
    pub fn compose(primary: Failure, suppressed: Failure) -> Self {
        Failure::Both(Box::new(primary), Box::new(suppressed))
    }

    /// Reify a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "thunk panicked".to_string()
        };
        Failure::msg(text)
    }

    /// Whether this failure is the cancellation condition.
    ///
    /// A composite counts as canceled only if its primary arm does.
    pub fn is_canceled(&self) -> bool {
        match self {
            Failure::Canceled => true,
            Failure::Both(primary, _) => primary.is_canceled(),
            Failure::Raised(_) => false,
        }
    }

    /// Downcast the raised arm to a concrete error type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Failure::Raised(err) => err.downcast_ref::<E>(),
            Failure::Both(primary, _) => primary.downcast_ref::<E>(),
            Failure::Canceled => None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Raised(err) => write!(f, "{}", err),
            Failure::Canceled => write!(f, "computation canceled"),
            Failure::Both(primary, suppressed) => {
                write!(f, "{} (suppressed: {})", primary, suppressed)
            }
        }
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Failure::Raised(err) => Some(err.as_ref()),
            Failure::Both(primary, _) => Some(primary.as_ref()),
            Failure::Canceled => None,
        }
    }
}

/// A plain string error, used by [`Failure::msg`] and reified panics.
#[derive(Debug, Clone)]
pub struct Message(pub String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for Message {}

/// Error raised when settling an already-settled completion cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadySettled;

impl fmt::Display for AlreadySettled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion cell already settled")
    }
}

impl Error for AlreadySettled {}
