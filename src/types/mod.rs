//! Core types shared across the engine.
//!
//! - [`id`]: Identifier types (`StageId`, `TaskId`)
//! - [`cancel`]: Cancellation reason, kind, and cooperative token
//! - [`failure`]: Stage failure causes
//! - [`bound`]: Concurrency and queue bounds

pub mod bound;
pub mod cancel;
pub mod failure;
pub mod id;

pub use bound::{Bound, UNBOUNDED};
pub use cancel::{CancelKind, CancelReason, CancelToken, is_interrupted, sleep_interruptibly};
pub use failure::Failure;
pub use id::{StageId, TaskId};
