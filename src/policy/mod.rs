//! Concurrency policies.
//!
//! A policy bounds how many actions run at once and how many may wait. One
//! [`PolicyExecutor`] is one policy instance; executors sharing an instance
//! share its bounds.

pub mod config;
pub mod executor;
pub mod task;

pub use config::{MAX_ASYNC, MAX_QUEUED, MaxPolicy, PolicyConfig};
pub use executor::{MAX_QUEUE_SIZE, PolicyExecutor, PolicyMetrics};
pub use task::{TaskHandle, TaskState};
