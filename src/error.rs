//! Error types for contextflow.
//!
//! Errors are split by where they surface:
//!
//! - [`ConfigError`]: raised synchronously by builders and setters
//! - [`ContextError`]: raised by a context provider during capture or apply
//! - [`Error`]: the crate-wide error, wrapping the above plus admission,
//!   lifecycle, and retrieval failures
//!
//! A stage's own failure cause is a [`Failure`](crate::types::Failure), which
//! is distinct from these infrastructure errors and can carry one of them.

use crate::types::Failure;
use std::sync::Arc;
use std::time::Duration;

/// Configuration errors raised at builder `build()` or setter call time.
///
/// Every variant that concerns context types names all offending types, not
/// only the first one found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A context type appears in more than one of propagated/cleared/unchanged.
    #[error("context types configured in more than one set: {}", .types.join(", "))]
    OverlappingContextTypes {
        /// Every type (including the remaining sentinel) found in several sets.
        types: Vec<String>,
    },
    /// A propagated or cleared context type is not registered.
    #[error("context types are not available: {}", .types.join(", "))]
    UnavailableContextTypes {
        /// Every unresolvable type named in propagated or cleared.
        types: Vec<String>,
    },
    /// A numeric bound is outside its valid range.
    #[error("{setting} must be -1 (unbounded) or at least 1, got {value}")]
    OutOfRange {
        /// The setting being configured.
        setting: &'static str,
        /// The rejected value.
        value: i64,
    },
    /// A configuration value could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable or file key.
        key: String,
        /// Parse failure description.
        reason: String,
    },
}

/// Errors raised by a registered context provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// Reading the thread's current value failed.
    #[error("failed to capture {context_type} context: {reason}")]
    Capture {
        /// The context type whose capture failed.
        context_type: Arc<str>,
        /// Provider-supplied reason.
        reason: String,
    },
    /// Installing a captured or cleared value on the thread failed.
    #[error("failed to apply {context_type} context: {reason}")]
    Apply {
        /// The context type whose apply failed.
        context_type: Arc<str>,
        /// Provider-supplied reason.
        reason: String,
    },
}

impl ContextError {
    /// Returns the context type that raised the error.
    #[must_use]
    pub fn context_type(&self) -> &str {
        match self {
            Self::Capture { context_type, .. } | Self::Apply { context_type, .. } => context_type,
        }
    }
}

/// The crate-wide error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A context provider failed.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Both the concurrency and queue bounds are exhausted.
    #[error("task rejected by concurrencyPolicy[{policy}]: {bound} of {limit} reached")]
    CapacityExceeded {
        /// Name of the rejecting policy.
        policy: Arc<str>,
        /// The bound that was exhausted (`maxQueueSize`).
        bound: &'static str,
        /// The configured limit of that bound.
        limit: usize,
    },
    /// A lifecycle operation was attempted on a container-owned executor.
    #[error("{operation} is not permitted on container-managed executor {executor}")]
    LifecycleViolation {
        /// Name of the executor.
        executor: Arc<str>,
        /// The rejected operation.
        operation: &'static str,
    },
    /// The executor no longer accepts submissions.
    #[error("executor {executor} has been shut down")]
    Shutdown {
        /// Name of the executor or pool.
        executor: Arc<str>,
    },
    /// A worker pool could not start a thread and has none left to run the job.
    #[error("pool {pool} could not start a worker thread: {reason}")]
    WorkerStart {
        /// Name of the pool.
        pool: Arc<str>,
        /// The underlying spawn error.
        reason: String,
    },
    /// A bounded wait elapsed before the stage completed.
    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),
    /// The stage completed exceptionally.
    #[error("stage completed exceptionally: {0}")]
    Failed(Failure),
}

impl Error {
    /// Returns true if this is a capacity rejection.
    #[must_use]
    pub const fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Returns the stage failure, if this error carries one.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}

/// Result alias using [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;
