//! Executors that stages dispatch their actions to.
//!
//! [`Executor`] is the seam between the stage algebra and whatever runs the
//! work. A [`ManagedExecutor`] routes work through a concurrency policy and
//! exposes a context propagator; any other executor (a bare [`ThreadPool`],
//! [`InlineExecutor`], or a host type) is *unmanaged* and propagates nothing.

pub mod managed;

pub use managed::{ManagedExecutor, ManagedExecutorBuilder, Ownership};

use crate::context::ContextPropagator;
use crate::error::Error;
use crate::policy::TaskHandle;
use crate::runtime::{Runnable, ThreadPool, WorkerPool};
use std::fmt;
use std::sync::Arc;

/// Something that runs [`Runnable`]s.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Runs or schedules `runnable`.
    ///
    /// Returns a handle when the work is tracked by a policy and can be
    /// cancelled through it.
    fn execute(&self, runnable: Runnable) -> Result<Option<TaskHandle>, Error>;

    /// The propagator used to capture context for work sent here, if managed.
    fn propagator(&self) -> Option<&ContextPropagator> {
        None
    }

    /// The name of the governing concurrency policy, if any.
    fn policy_name(&self) -> Option<&str> {
        None
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn execute(&self, runnable: Runnable) -> Result<Option<TaskHandle>, Error> {
        (**self).execute(runnable)
    }

    fn propagator(&self) -> Option<&ContextPropagator> {
        (**self).propagator()
    }

    fn policy_name(&self) -> Option<&str> {
        (**self).policy_name()
    }
}

impl Executor for ThreadPool {
    fn name(&self) -> &str {
        WorkerPool::name(self)
    }

    fn execute(&self, runnable: Runnable) -> Result<Option<TaskHandle>, Error> {
        let (job, _) = runnable.into_parts();
        self.spawn(job)?;
        Ok(None)
    }
}

/// Runs every runnable immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    fn execute(&self, runnable: Runnable) -> Result<Option<TaskHandle>, Error> {
        runnable.run();
        Ok(None)
    }
}
