//! Threads, jobs, and timers underneath the policy layer.
//!
//! - [`task`]: [`Runnable`] units of work with cancellation hooks
//! - [`pool`]: the [`WorkerPool`] seam and the elastic [`ThreadPool`]
//! - [`timer`]: deadline heap and the process-wide [`Timer`] thread

pub mod pool;
pub mod task;
pub mod timer;

pub use pool::{ThreadPool, ThreadPoolBuilder, WorkerPool};
pub use task::{CancelHook, Job, Runnable};
pub use timer::{Timer, TimerHeap, TimerKey};
