//! Shared completion state behind every stage reference.

use super::Outcome;
use crate::executor::Executor;
use crate::policy::{TaskHandle, TaskState};
use crate::types::StageId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

/// How a dependent callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Firing {
    /// The prior was already complete when the dependent was attached; the
    /// callback runs on the attaching thread.
    Inline,
    /// The prior completed later; the callback runs on the completing thread.
    Deferred,
}

pub(crate) type Dependent = Box<dyn FnOnce(Firing) + Send + 'static>;

/// Result of completing a cell from outside its computation.
#[derive(Debug)]
pub(crate) enum Preempted {
    /// The cell was already complete; nothing changed.
    AlreadyDone,
    /// The outcome was published; carries the computing task if attached.
    Published(Option<TaskHandle>),
}

struct CellState<T> {
    outcome: Option<Outcome<T>>,
    dependents: Vec<Dependent>,
    wakers: Vec<Waker>,
    task: Option<TaskHandle>,
    /// Set when the outcome was decided outside the computing task; holds
    /// the interrupt flag to apply to a task attached after the fact.
    preempted: Option<bool>,
}

pub(crate) struct Cell<T> {
    pub(crate) id: StageId,
    pub(crate) facility: Arc<dyn Executor>,
    state: Mutex<CellState<T>>,
    done: Condvar,
}

impl<T: Clone + Send + 'static> Cell<T> {
    pub(crate) fn new(facility: Arc<dyn Executor>) -> Self {
        Self {
            id: StageId::next(),
            facility,
            state: Mutex::new(CellState {
                outcome: None,
                dependents: Vec::new(),
                wakers: Vec::new(),
                task: None,
                preempted: None,
            }),
            done: Condvar::new(),
        }
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        self.state.lock().outcome.clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Publishes `outcome` if the cell is pending, then fires dependents.
    pub(crate) fn try_complete(&self, outcome: Outcome<T>) -> bool {
        let (dependents, wakers) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            self.done.notify_all();
            (
                std::mem::take(&mut state.dependents),
                std::mem::take(&mut state.wakers),
            )
        };
        Self::fire(dependents, wakers);
        true
    }

    /// Publishes an outcome decided outside the computing task.
    ///
    /// Hands back the task computing the cell, if one is attached yet. A
    /// task attached later is cancelled with `interrupt`.
    pub(crate) fn preempt(&self, outcome: Outcome<T>, interrupt: bool) -> Preempted {
        let (dependents, wakers, task) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return Preempted::AlreadyDone;
            }
            state.outcome = Some(outcome);
            state.preempted = Some(interrupt);
            self.done.notify_all();
            (
                std::mem::take(&mut state.dependents),
                std::mem::take(&mut state.wakers),
                state.task.take(),
            )
        };
        Self::fire(dependents, wakers);
        Preempted::Published(task)
    }

    /// Overwrites the outcome. Dependents fire only if the cell was pending.
    ///
    /// Overwriting a pending cell preempts its computing task, which is
    /// returned for cancellation.
    pub(crate) fn obtrude(&self, outcome: Outcome<T>) -> Option<TaskHandle> {
        let (dependents, wakers, task) = {
            let mut state = self.state.lock();
            let was_pending = state.outcome.is_none();
            state.outcome = Some(outcome);
            self.done.notify_all();
            if was_pending {
                state.preempted = Some(true);
                (
                    std::mem::take(&mut state.dependents),
                    std::mem::take(&mut state.wakers),
                    state.task.take(),
                )
            } else {
                (Vec::new(), Vec::new(), None)
            }
        };
        Self::fire(dependents, wakers);
        task
    }

    fn fire(dependents: Vec<Dependent>, wakers: Vec<Waker>) {
        for waker in wakers {
            waker.wake();
        }
        for dependent in dependents {
            dependent(Firing::Deferred);
        }
    }

    /// Registers `dependent`, or hands it back if the cell is already done.
    pub(crate) fn on_complete(&self, dependent: Dependent) -> Option<Dependent> {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return Some(dependent);
        }
        state.dependents.push(dependent);
        None
    }

    /// Runs `dependent` now if the cell is done, otherwise when it completes.
    pub(crate) fn when_done(&self, dependent: Dependent) {
        if let Some(dependent) = self.on_complete(dependent) {
            dependent(Firing::Inline);
        }
    }

    pub(crate) fn dependent_count(&self) -> usize {
        self.state.lock().dependents.len()
    }

    /// Returns the outcome, or registers `waker` and returns `None`.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        if let Some(outcome) = &state.outcome {
            return Some(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
        None
    }

    pub(crate) fn wait(&self) -> Outcome<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }

    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    /// Records the policy task computing this cell.
    ///
    /// If the cell was preempted before the task got here, the task is
    /// cancelled the way the preempting call asked. Otherwise a task still
    /// queued for an already-complete cell is cancelled so it frees its
    /// queue slot.
    pub(crate) fn attach_task(&self, task: TaskHandle) {
        let mut state = self.state.lock();
        if state.outcome.is_none() {
            state.task = Some(task);
            return;
        }
        let preempted = state.preempted;
        drop(state);
        match preempted {
            Some(interrupt) => {
                task.cancel(interrupt);
            }
            None if task.state() == TaskState::Queued => {
                task.cancel(false);
            }
            None => {}
        }
    }

    pub(crate) fn take_task(&self) -> Option<TaskHandle> {
        self.state.lock().task.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyConfig, PolicyExecutor};
    use crate::runtime::{Runnable, ThreadPool};
    use crate::test_utils::{Latch, TEST_TIMEOUT, init_test_logging};
    use crate::types::{CancelReason, Failure, sleep_interruptibly};

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    fn cell() -> Cell<i32> {
        Cell::new(Arc::new(ThreadPool::shared()))
    }

    /// Submits a task that sleeps until interrupted.
    fn sleeper(policy: &PolicyExecutor, entered: &Latch, interrupted: &Latch) -> TaskHandle {
        let (entered, interrupted) = (entered.clone(), interrupted.clone());
        policy
            .submit(Runnable::new(move || {
                entered.count_down();
                if !sleep_interruptibly(TEST_TIMEOUT) {
                    interrupted.count_down();
                }
            }))
            .expect("admitted")
    }

    #[test]
    fn task_attached_after_interrupting_cancel_is_interrupted() {
        init_test("task_attached_after_interrupting_cancel_is_interrupted");
        let policy = PolicyExecutor::with_shared_pool(PolicyConfig::new("late-attach"));
        let entered = Latch::new(1);
        let interrupted = Latch::new(1);
        let task = sleeper(&policy, &entered, &interrupted);
        assert!(entered.wait_for(TEST_TIMEOUT));

        let cell = cell();
        let cancelled = Err(Failure::Cancelled(CancelReason::user("stop")));
        assert!(matches!(cell.preempt(cancelled, true), Preempted::Published(None)));
        cell.attach_task(task.clone());
        assert!(interrupted.wait_for(TEST_TIMEOUT), "running task interrupted");
        assert!(task.is_cancelled());
        crate::test_complete!("task_attached_after_interrupting_cancel_is_interrupted");
    }

    #[test]
    fn task_attached_after_obtrude_is_interrupted() {
        init_test("task_attached_after_obtrude_is_interrupted");
        let policy = PolicyExecutor::with_shared_pool(PolicyConfig::new("late-obtrude"));
        let entered = Latch::new(1);
        let interrupted = Latch::new(1);
        let task = sleeper(&policy, &entered, &interrupted);
        assert!(entered.wait_for(TEST_TIMEOUT));

        let cell = cell();
        assert!(cell.obtrude(Ok(3)).is_none());
        cell.attach_task(task);
        assert!(interrupted.wait_for(TEST_TIMEOUT));
        assert!(matches!(cell.outcome(), Some(Ok(3))));
        crate::test_complete!("task_attached_after_obtrude_is_interrupted");
    }

    #[test]
    fn task_attached_after_own_completion_keeps_running() {
        init_test("task_attached_after_own_completion_keeps_running");
        let policy = PolicyExecutor::with_shared_pool(PolicyConfig::new("self-settled"));
        let entered = Latch::new(1);
        let interrupted = Latch::new(1);
        let task = sleeper(&policy, &entered, &interrupted);
        assert!(entered.wait_for(TEST_TIMEOUT));

        let cell = cell();
        assert!(cell.try_complete(Ok(1)));
        cell.attach_task(task.clone());
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.cancel(true));
        assert!(interrupted.wait_for(TEST_TIMEOUT));
        crate::test_complete!("task_attached_after_own_completion_keeps_running");
    }

    #[test]
    fn preempt_hands_back_the_attached_task_once() {
        init_test("preempt_hands_back_the_attached_task_once");
        let policy = PolicyExecutor::with_shared_pool(PolicyConfig::new("attached"));
        let entered = Latch::new(1);
        let interrupted = Latch::new(1);
        let task = sleeper(&policy, &entered, &interrupted);

        let cell = cell();
        cell.attach_task(task.clone());
        match cell.preempt(Ok(1), false) {
            Preempted::Published(taken) => assert_eq!(taken, Some(task.clone())),
            Preempted::AlreadyDone => panic!("cell was pending"),
        }
        assert!(matches!(cell.preempt(Ok(2), true), Preempted::AlreadyDone));
        assert!(cell.take_task().is_none());
        assert!(task.cancel(true) || task.is_done());
        crate::test_complete!("preempt_hands_back_the_attached_task_once");
    }
}
