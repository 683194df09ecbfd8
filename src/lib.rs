//! Contextflow: context-propagating managed completion stages.
//!
//! # Overview
//!
//! Contextflow runs dependent actions (apply, accept, combine, compose,
//! handle, recover) on completion stages whose work is governed by a
//! bounded-concurrency policy and executed with the thread context that was
//! current when the action was registered. Context moves explicitly: a
//! snapshot is captured at registration and applied around the action, then
//! the thread's prior context is restored.
//!
//! # Core Guarantees
//!
//! - **At-most-once completion**: the first of complete, fail, cancel or timeout wins
//! - **Captured, not ambient**: actions observe registration-time context
//! - **Bounded admission**: a policy never exceeds its concurrency and queue bounds
//!   except through the explicit caller-runs fallback
//! - **No silent drops**: rejected or cancelled work fails its stage
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, bounds, failures and cancellation tokens
//! - [`context`]: providers, the registry, snapshots and the propagator
//! - [`runtime`]: runnables, the worker pool and the timer thread
//! - [`policy`]: admission control (concurrency bound, FIFO queue, caller-runs)
//! - [`executor`]: the [`Executor`] trait and [`ManagedExecutor`]
//! - [`stage`]: [`ManagedStage`], [`MinimalStage`] and the [`CompletionStage`] algebra
//! - [`config`]: declarative [`ExecutorConfig`] with environment overrides
//! - [`error`](mod@error): error types
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod policy;
pub mod runtime;
pub mod stage;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use config::ExecutorConfig;
pub use context::{
    ALL_REMAINING, ContextPropagator, ContextRegistry, ContextSlot, ContextSnapshot,
    ThreadContextProvider,
};
pub use error::{ConfigError, ContextError, Error, Result};
pub use executor::{Executor, InlineExecutor, ManagedExecutor, ManagedExecutorBuilder, Ownership};
pub use policy::{MaxPolicy, PolicyConfig, PolicyExecutor, PolicyMetrics, TaskHandle, TaskState};
pub use runtime::ThreadPool;
pub use stage::{
    CompletionStage, ManagedStage, MinimalStage, Outcome, StageStatus, all_of, any_of,
};
pub use types::{CancelReason, CancelToken, Failure, StageId, TaskId};
