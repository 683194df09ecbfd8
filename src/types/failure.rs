//! Stage failure causes.
//!
//! A [`Failure`] is what a stage stores when it completes exceptionally. It
//! keeps user task errors, cancellation, and infrastructure errors apart so
//! callers can branch on "was this cancelled" versus "did the action fail".
//!
//! Failures that flow from a prior stage into a dependent are wrapped once in
//! [`Failure::Completion`]; [`Failure::root`] unwraps them again.

use super::cancel::CancelReason;
use crate::error::Error;
use core::fmt;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// The failure cause of an exceptionally completed stage.
#[derive(Clone)]
pub enum Failure {
    /// The user action returned an error.
    Task(Arc<dyn std::error::Error + Send + Sync>),
    /// The user action panicked.
    Panicked(Arc<str>),
    /// The stage was cancelled.
    Cancelled(CancelReason),
    /// The stage did not complete before an `or_timeout` deadline.
    TimedOut(Duration),
    /// The engine could not run the action.
    Infrastructure(Arc<Error>),
    /// A prior stage failed and this dependent never ran its action.
    Completion(Arc<Failure>),
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl Failure {
    /// Wraps a user error as a task failure.
    pub fn task<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Task(Arc::new(error))
    }

    /// Creates a task failure carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Task(Arc::new(Message(message.into())))
    }

    /// Wraps an engine error.
    pub fn infrastructure(error: impl Into<Error>) -> Self {
        Self::Infrastructure(Arc::new(error.into()))
    }

    /// Converts a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let text = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self::Panicked(Arc::from(text))
    }

    /// Wraps this failure for delivery to a dependent stage.
    ///
    /// A failure that is already a completion wrapper is passed through
    /// unchanged so chains never nest wrappers.
    #[must_use]
    pub fn propagated(self) -> Self {
        match self {
            Self::Completion(_) => self,
            other => Self::Completion(Arc::new(other)),
        }
    }

    /// Returns the innermost failure, unwrapping completion wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        let mut current = self;
        while let Self::Completion(inner) = current {
            current = inner;
        }
        current
    }

    /// Returns true if the root cause is a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Self::Cancelled(_))
    }

    /// Returns true if this failure was delivered from a prior stage.
    #[must_use]
    pub const fn is_completion(&self) -> bool {
        matches!(self, Self::Completion(_))
    }

    /// Returns the cancellation reason of the root cause, if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self.root() {
            Self::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns the engine error of the root cause, if any.
    #[must_use]
    pub fn infrastructure_error(&self) -> Option<&Error> {
        match self.root() {
            Self::Infrastructure(error) => Some(error),
            _ => None,
        }
    }

    /// Downcasts the root task error to a concrete type.
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self.root() {
            Self::Task(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(error) => f.debug_tuple("Task").field(&error.to_string()).finish(),
            Self::Panicked(message) => f.debug_tuple("Panicked").field(message).finish(),
            Self::Cancelled(reason) => f.debug_tuple("Cancelled").field(reason).finish(),
            Self::TimedOut(after) => f.debug_tuple("TimedOut").field(after).finish(),
            Self::Infrastructure(error) => f.debug_tuple("Infrastructure").field(error).finish(),
            Self::Completion(inner) => f.debug_tuple("Completion").field(inner).finish(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(error) => write!(f, "task failed: {error}"),
            Self::Panicked(message) => write!(f, "task panicked: {message}"),
            Self::Cancelled(reason) => write!(f, "cancelled ({reason})"),
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
            Self::Infrastructure(error) => write!(f, "{error}"),
            Self::Completion(inner) => write!(f, "prior stage failed: {inner}"),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Task(error) => Some(error.as_ref()),
            Self::Infrastructure(error) => Some(error.as_ref()),
            Self::Completion(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<CancelReason> for Failure {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[derive(Debug, PartialEq)]
    struct DivideByZero;

    impl fmt::Display for DivideByZero {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("/ by zero")
        }
    }

    impl std::error::Error for DivideByZero {}

    #[test]
    fn propagation_wraps_once() {
        let failure = Failure::task(DivideByZero).propagated().propagated();
        match &failure {
            Failure::Completion(inner) => assert!(matches!(**inner, Failure::Task(_))),
            other => panic!("expected completion wrapper, got {other:?}"),
        }
        assert_eq!(failure.downcast_ref::<DivideByZero>(), Some(&DivideByZero));
    }

    #[test]
    fn cancellation_is_detected_through_wrappers() {
        let failure = Failure::from(CancelReason::user("stop")).propagated();
        assert!(failure.is_cancellation());
        assert!(failure.is_completion());
        assert_eq!(failure.cancel_reason(), Some(&CancelReason::user("stop")));
        assert!(!Failure::message("boom").is_cancellation());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let failure = Failure::from_panic(Box::new("static"));
        assert_eq!(failure.to_string(), "task panicked: static");
        let failure = Failure::from_panic(Box::new(String::from("owned")));
        assert_eq!(failure.to_string(), "task panicked: owned");
        let failure = Failure::from_panic(Box::new(7_u8));
        assert!(failure.to_string().contains("non-string"));
    }

    #[test]
    fn infrastructure_error_is_reachable() {
        let failure = Failure::infrastructure(ConfigError::OutOfRange {
            setting: "maxQueued",
            value: -10,
        })
        .propagated();
        assert!(matches!(
            failure.infrastructure_error(),
            Some(Error::Config(ConfigError::OutOfRange { value: -10, .. }))
        ));
    }
}
