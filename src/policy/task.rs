//! Handles to tasks submitted through a concurrency policy.

use super::executor::PolicyInner;
use crate::types::{CancelReason, CancelToken, TaskId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Observable state of a policy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the policy queue.
    Queued,
    /// Running on a worker or on the submitting thread.
    Running,
    /// Finished running.
    Completed,
    /// Cancelled before or while running.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Pending,
    Queued { key: usize },
    Running,
    Completed,
    Cancelled,
}

pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) slot: Mutex<Slot>,
    pub(crate) token: CancelToken,
    pub(crate) policy: Weak<PolicyInner>,
}

/// A cancellable reference to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(policy: Weak<PolicyInner>) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: TaskId::next(),
                slot: Mutex::new(Slot::Pending),
                token: CancelToken::new(),
                policy,
            }),
        }
    }

    /// Returns the task identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match *self.shared.slot.lock() {
            Slot::Pending | Slot::Queued { .. } => TaskState::Queued,
            Slot::Running => TaskState::Running,
            Slot::Completed => TaskState::Completed,
            Slot::Cancelled => TaskState::Cancelled,
        }
    }

    /// Returns true once the task has completed or been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state(), TaskState::Completed | TaskState::Cancelled)
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Returns the token the running action can poll for interrupts.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    /// Cancels the task.
    ///
    /// A queued task is removed from the queue and never runs. A running task
    /// is marked cancelled and, if `interrupt` is set, its token is cancelled
    /// and its thread unparked. Returns false if the task already finished.
    pub fn cancel(&self, interrupt: bool) -> bool {
        match self.shared.policy.upgrade() {
            Some(policy) => policy.cancel_task(self, interrupt, CancelReason::user("task cancelled")),
            None => {
                let mut slot = self.shared.slot.lock();
                match *slot {
                    Slot::Running => {
                        *slot = Slot::Cancelled;
                        drop(slot);
                        if interrupt {
                            self.shared.token.cancel(CancelReason::user("task cancelled"));
                        }
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub(crate) fn slot(&self) -> Slot {
        *self.shared.slot.lock()
    }

    pub(crate) fn set_slot(&self, slot: Slot) {
        *self.shared.slot.lock() = slot;
    }

    /// Marks a running task completed; a cancelled task stays cancelled.
    pub(crate) fn finish(&self) {
        let mut slot = self.shared.slot.lock();
        if *slot == Slot::Running {
            *slot = Slot::Completed;
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
