//! The managed completion stage.

use super::dispatch::{self, Mode};
use super::cell::{Cell, Preempted};
use super::minimal::MinimalStage;
use super::{CompletionStage, Outcome, sealed};
use crate::error::Error;
use crate::executor::Executor;
use crate::policy::TaskHandle;
use crate::runtime::{ThreadPool, Timer};
use crate::tracing_compat::{debug, trace};
use crate::types::{CancelReason, Failure, StageId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Completion status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    /// Not yet completed.
    Pending,
    /// Completed with a value.
    Succeeded,
    /// Completed with a failure other than a direct cancellation.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A node in a graph of asynchronous computations.
///
/// A stage completes at most once; [`obtrude_value`](Self::obtrude_value) and
/// [`obtrude_failure`](Self::obtrude_failure) are the only ways to change a
/// published outcome. Every stage carries a default execution facility, the
/// executor its `_async` continuations are dispatched to. The composition
/// algebra lives on [`CompletionStage`].
///
/// Cloning returns another reference to the same stage.
pub struct ManagedStage<T> {
    pub(crate) cell: Arc<Cell<T>>,
}

impl<T> Clone for ManagedStage<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone + Send + 'static> ManagedStage<T> {
    pub(crate) fn with_facility(facility: Arc<dyn Executor>) -> Self {
        Self {
            cell: Arc::new(Cell::new(facility)),
        }
    }

    /// Creates an incomplete stage with no propagator and no policy.
    ///
    /// Its `_async` continuations run on the process-wide thread pool.
    #[must_use]
    pub fn unmanaged() -> Self {
        Self::with_facility(Arc::new(ThreadPool::shared()))
    }

    /// Creates an incomplete stage whose default facility is `executor`.
    #[must_use]
    pub fn incomplete_on<E>(executor: &E) -> Self
    where
        E: Executor + Clone + 'static,
    {
        Self::with_facility(Arc::new(executor.clone()))
    }

    /// Returns the stage identifier.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.cell.id
    }

    /// Returns the completion status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        match self.cell.outcome() {
            None => StageStatus::Pending,
            Some(Ok(_)) => StageStatus::Succeeded,
            Some(Err(Failure::Cancelled(_))) => StageStatus::Cancelled,
            Some(Err(_)) => StageStatus::Failed,
        }
    }

    /// Returns true once the stage has completed in any way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Returns true if the stage was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == StageStatus::Cancelled
    }

    /// Returns true if the stage failed or was cancelled.
    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(self.status(), StageStatus::Failed | StageStatus::Cancelled)
    }

    /// Returns the outcome if the stage is complete.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.cell.outcome()
    }

    /// Blocks until the stage completes and returns its outcome.
    #[must_use]
    pub fn join(&self) -> Outcome<T> {
        self.cell.wait()
    }

    /// Blocks until the stage completes and returns its value.
    pub fn get(&self) -> Result<T, Error> {
        self.join().map_err(Error::Failed)
    }

    /// Blocks for at most `timeout`.
    ///
    /// A timeout leaves the stage untouched and returns [`Error::Timeout`].
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let outcome = match Instant::now().checked_add(timeout) {
            Some(deadline) => self.cell.wait_until(deadline),
            None => Some(self.cell.wait()),
        };
        match outcome {
            Some(outcome) => outcome.map_err(Error::Failed),
            None => Err(Error::Timeout(timeout)),
        }
    }

    /// Returns the value if complete, `default` if still pending.
    pub fn get_now(&self, default: T) -> Result<T, Error> {
        match self.cell.outcome() {
            Some(outcome) => outcome.map_err(Error::Failed),
            None => Ok(default),
        }
    }

    /// Completes the stage with `value`.
    ///
    /// Returns false if the stage was already complete. On success, a policy
    /// task still computing this stage is cancelled with interrupt and its
    /// late result is discarded.
    pub fn complete(&self, value: T) -> bool {
        self.complete_externally(Ok(value), true)
    }

    /// Completes the stage with `failure`. Symmetric to [`complete`](Self::complete).
    pub fn complete_exceptionally(&self, failure: Failure) -> bool {
        self.complete_externally(Err(failure), true)
    }

    /// Cancels the stage.
    ///
    /// Completes with [`Failure::Cancelled`] and cancels the computing policy
    /// task, interrupting it if `interrupt` is set. Not-yet-completed
    /// dependents fail with a cancellation-rooted cause. Returns false if the
    /// stage was already complete.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.complete_externally(
            Err(Failure::Cancelled(CancelReason::user("stage cancelled"))),
            interrupt,
        )
    }

    fn complete_externally(&self, outcome: Outcome<T>, interrupt: bool) -> bool {
        let Preempted::Published(task) = self.cell.preempt(outcome, interrupt) else {
            return false;
        };
        if let Some(task) = task {
            let cancelled = task.cancel(interrupt);
            debug!(stage = %self.id(), task = %task.id(), cancelled, interrupt, "completed externally");
        }
        true
    }

    /// Completes the stage from its own computation, leaving the task alone.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let settled = self.cell.try_complete(outcome);
        if settled {
            self.cell.take_task();
        } else {
            trace!(stage = %self.id(), "late outcome discarded");
        }
        settled
    }

    /// Overwrites the outcome with `value`, whatever the current status.
    ///
    /// On a pending stage this counts as premature completion: the policy
    /// task computing the stage is cancelled with interrupt.
    pub fn obtrude_value(&self, value: T) {
        trace!(stage = %self.id(), "obtrude value");
        let task = self.cell.obtrude(Ok(value));
        self.interrupt_preempted(task);
    }

    /// Overwrites the outcome with `failure`, whatever the current status.
    ///
    /// Interrupts a computing task like [`obtrude_value`](Self::obtrude_value).
    pub fn obtrude_failure(&self, failure: Failure) {
        trace!(stage = %self.id(), "obtrude failure");
        let task = self.cell.obtrude(Err(failure));
        self.interrupt_preempted(task);
    }

    fn interrupt_preempted(&self, task: Option<TaskHandle>) {
        if let Some(task) = task {
            let cancelled = task.cancel(true);
            debug!(stage = %self.id(), task = %task.id(), cancelled, "obtruded while computing");
        }
    }

    /// Runs `supplier` on the default facility and completes this stage with
    /// its result if still pending.
    pub fn complete_async<F>(&self, supplier: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        dispatch::complete_async(self, Mode::Default, supplier);
        self.clone()
    }

    /// Like [`complete_async`](Self::complete_async) on the given executor.
    pub fn complete_async_on<F, E>(&self, supplier: F, executor: &E) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::complete_async(self, Mode::on(executor), supplier);
        self.clone()
    }

    /// Completes with `value` if still pending after `timeout`.
    pub fn complete_on_timeout(&self, value: T, timeout: Duration) -> Self {
        let stage = self.clone();
        self.after(timeout, move || {
            stage.settle(Ok(value));
        });
        self.clone()
    }

    /// Fails with [`Failure::TimedOut`] if still pending after `timeout`.
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        let stage = self.clone();
        self.after(timeout, move || {
            if stage.settle(Err(Failure::TimedOut(timeout))) {
                debug!(stage = %stage.id(), timeout_ms = timeout.as_millis() as u64, "stage timed out");
            }
        });
        self.clone()
    }

    fn after(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        if self.is_done() {
            return;
        }
        let timer = Timer::global();
        let Some(key) = timer.schedule(delay, Box::new(action)) else {
            return;
        };
        self.cell.when_done(Box::new(move |_| {
            timer.cancel(key);
        }));
    }

    /// Returns a dependent that completes with this stage's outcome.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.then_apply(|value| value)
    }

    /// Returns a view restricted to the composition algebra.
    #[must_use]
    pub fn minimal_stage(&self) -> MinimalStage<T> {
        MinimalStage::new(self.clone())
    }

    /// Creates a placeholder sharing this stage's facility.
    ///
    /// The placeholder is not a dependent: nothing that happens to this
    /// stage affects it.
    #[must_use]
    pub fn new_incomplete_stage<U: Clone + Send + 'static>(&self) -> ManagedStage<U> {
        ManagedStage::with_facility(Arc::clone(&self.cell.facility))
    }

    /// Returns the number of dependents waiting on this stage.
    #[must_use]
    pub fn number_of_dependents(&self) -> usize {
        self.cell.dependent_count()
    }

    /// Returns the default execution facility.
    #[must_use]
    pub fn default_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.cell.facility)
    }

    /// Returns true if the default facility propagates context.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.cell.facility.propagator().is_some()
    }
}

impl<T: Clone + Send + 'static> sealed::Sealed<T> for ManagedStage<T> {
    fn stage(&self) -> &ManagedStage<T> {
        self
    }
}

impl<T: Clone + Send + 'static> CompletionStage<T> for ManagedStage<T> {}

impl<T: Clone + Send + 'static> Future for ManagedStage<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Display for ManagedStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let facility = &self.cell.facility;
        write!(
            f,
            "ManagedStage[{}] {}, executor {}, policy {}",
            self.id(),
            self.status(),
            facility.name(),
            facility.policy_name().unwrap_or("none")
        )
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for ManagedStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedStage")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("executor", &self.cell.facility.name())
            .field("dependents", &self.number_of_dependents())
            .finish()
    }
}
