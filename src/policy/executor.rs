//! The admission state machine.
//!
//! Each [`PolicyExecutor`] owns one policy instance: a running count, a FIFO
//! queue of waiting tasks and the set of active task handles. Admission is
//! decided under a single lock so that the bounds hold at every instant:
//!
//! 1. a free concurrency slot runs the task on the worker pool;
//! 2. otherwise a free queue slot enqueues it;
//! 3. otherwise, with the caller-runs fallback in effect, it runs on the
//!    submitting thread;
//! 4. otherwise it is rejected with [`Error::CapacityExceeded`].
//!
//! A worker that finishes a task pulls the next queued task on the same
//! thread, so the running count never drops while work is waiting.
//!
//! Lock order: policy state, then task status.

use super::config::PolicyConfig;
use super::task::{Slot, TaskHandle};
use crate::error::Error;
use crate::runtime::{Runnable, ThreadPool, WorkerPool};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{CancelReason, TaskId};
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bound name reported when the queue rejects a task.
pub const MAX_QUEUE_SIZE: &str = "maxQueueSize";

/// Point-in-time counters for one policy instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyMetrics {
    /// Tasks currently running, including caller-run tasks.
    pub running: usize,
    /// Tasks currently waiting in the queue.
    pub queued: usize,
    /// Tasks that were given a concurrency slot.
    pub total_admitted: u64,
    /// Tasks that had to wait in the queue.
    pub total_queued: u64,
    /// Tasks rejected for lack of capacity.
    pub total_rejected: u64,
    /// Tasks run on the submitting thread.
    pub total_run_inline: u64,
    /// Tasks cancelled while queued or running.
    pub total_cancelled: u64,
    /// Tasks that finished running.
    pub total_completed: u64,
}

#[derive(Debug, Default)]
struct Totals {
    admitted: u64,
    queued: u64,
    rejected: u64,
    run_inline: u64,
    cancelled: u64,
    completed: u64,
}

struct QueuedTask {
    handle: TaskHandle,
    runnable: Runnable,
}

struct PolicyState {
    running: usize,
    queue: VecDeque<(usize, TaskId)>,
    entries: Slab<QueuedTask>,
    active: HashMap<TaskId, TaskHandle>,
    accepting: bool,
    totals: Totals,
}

impl PolicyState {
    fn new() -> Self {
        Self {
            running: 0,
            queue: VecDeque::new(),
            entries: Slab::new(),
            active: HashMap::new(),
            accepting: true,
            totals: Totals::default(),
        }
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.entries.is_empty()
    }

    fn is_terminated(&self) -> bool {
        !self.accepting && self.is_idle()
    }

    /// Pops the oldest live queue entry, skipping slots freed by cancellation.
    fn pop_queued(&mut self) -> Option<QueuedTask> {
        while let Some((key, id)) = self.queue.pop_front() {
            let live = self
                .entries
                .get(key)
                .is_some_and(|entry| entry.handle.id() == id);
            if live {
                return Some(self.entries.remove(key));
            }
        }
        None
    }
}

pub(crate) struct PolicyInner {
    config: PolicyConfig,
    pool: Arc<dyn WorkerPool>,
    state: Mutex<PolicyState>,
    drained: Condvar,
}

impl PolicyInner {
    fn dispatch(self: &Arc<Self>, handle: TaskHandle, runnable: Runnable) -> Result<(), Error> {
        let inner = Arc::clone(self);
        self.pool
            .spawn(Box::new(move || inner.work(handle, runnable)))
    }

    fn work(self: &Arc<Self>, mut handle: TaskHandle, mut runnable: Runnable) {
        loop {
            self.run_task(&handle, runnable);
            match self.finish_and_next(&handle) {
                Some(next) => {
                    handle = next.handle;
                    runnable = next.runnable;
                }
                None => return,
            }
        }
    }

    fn run_task(&self, handle: &TaskHandle, runnable: Runnable) {
        if handle.slot() == Slot::Cancelled {
            let reason = handle
                .token()
                .reason()
                .unwrap_or_else(|| CancelReason::user("task cancelled"));
            runnable.discard(reason);
            return;
        }
        let _scope = handle.token().enter();
        let (job, _) = runnable.into_parts();
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(policy = %self.config.name(), task = %handle.id(), "task panicked");
        }
    }

    fn finish_and_next(&self, handle: &TaskHandle) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        state.active.remove(&handle.id());
        handle.finish();
        state.totals.completed += 1;
        if let Some(next) = state.pop_queued() {
            next.handle.set_slot(Slot::Running);
            state.active.insert(next.handle.id(), next.handle.clone());
            state.totals.admitted += 1;
            trace!(policy = %self.config.name(), task = %next.handle.id(), "dequeued task");
            return Some(next);
        }
        state.running -= 1;
        if state.is_idle() {
            self.drained.notify_all();
        }
        None
    }

    fn finish_inline(&self, handle: &TaskHandle) {
        let mut state = self.state.lock();
        state.active.remove(&handle.id());
        handle.finish();
        state.totals.completed += 1;
        if state.is_idle() {
            self.drained.notify_all();
        }
    }

    pub(crate) fn cancel_task(&self, handle: &TaskHandle, interrupt: bool, reason: CancelReason) -> bool {
        let mut state = self.state.lock();
        let mut slot = handle.shared.slot.lock();
        match *slot {
            Slot::Queued { key } => {
                *slot = Slot::Cancelled;
                drop(slot);
                let entry = state.entries.try_remove(key);
                state.totals.cancelled += 1;
                if state.is_idle() {
                    self.drained.notify_all();
                }
                drop(state);
                debug!(policy = %self.config.name(), task = %handle.id(), "queued task cancelled");
                if let Some(entry) = entry {
                    entry.runnable.discard(reason);
                }
                true
            }
            Slot::Running => {
                *slot = Slot::Cancelled;
                drop(slot);
                state.totals.cancelled += 1;
                drop(state);
                debug!(
                    policy = %self.config.name(),
                    task = %handle.id(),
                    interrupt,
                    "running task cancelled"
                );
                if interrupt {
                    handle.token().cancel(reason);
                }
                true
            }
            Slot::Pending | Slot::Completed | Slot::Cancelled => false,
        }
    }
}

/// Executes tasks under one concurrency policy instance.
///
/// Cloning shares the policy instance.
#[derive(Clone)]
pub struct PolicyExecutor {
    inner: Arc<PolicyInner>,
}

impl PolicyExecutor {
    /// Creates a policy instance that runs admitted tasks on `pool`.
    #[must_use]
    pub fn new(config: PolicyConfig, pool: Arc<dyn WorkerPool>) -> Self {
        debug!(policy = %config, pool = %pool.name(), "policy created");
        Self {
            inner: Arc::new(PolicyInner {
                config,
                pool,
                state: Mutex::new(PolicyState::new()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Creates a policy instance on the process-wide pool.
    #[must_use]
    pub fn with_shared_pool(config: PolicyConfig) -> Self {
        Self::new(config, Arc::new(ThreadPool::shared()))
    }

    /// Returns the policy configuration.
    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.inner.config
    }

    /// Returns the policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    /// Submits a task for admission.
    ///
    /// Returns a handle for an admitted, queued or caller-run task. A
    /// caller-run task has already finished when this returns.
    pub fn submit(&self, runnable: Runnable) -> Result<TaskHandle, Error> {
        let config = &self.inner.config;
        let handle = TaskHandle::new(Arc::downgrade(&self.inner));
        let mut state = self.inner.state.lock();
        if !state.accepting {
            return Err(Error::Shutdown {
                executor: config.shared_name(),
            });
        }

        if config.concurrency_bound().admits(state.running) {
            state.running += 1;
            state.totals.admitted += 1;
            handle.set_slot(Slot::Running);
            state.active.insert(handle.id(), handle.clone());
            drop(state);
            trace!(policy = %config.name(), task = %handle.id(), "task admitted");
            if let Err(err) = self.inner.dispatch(handle.clone(), runnable) {
                let mut state = self.inner.state.lock();
                state.running -= 1;
                state.totals.admitted -= 1;
                state.active.remove(&handle.id());
                handle.set_slot(Slot::Cancelled);
                if state.is_idle() {
                    self.inner.drained.notify_all();
                }
                return Err(err);
            }
            return Ok(handle);
        }

        if config.queue_bound().admits(state.entries.len()) {
            let key = state.entries.insert(QueuedTask {
                handle: handle.clone(),
                runnable,
            });
            state.queue.push_back((key, handle.id()));
            state.totals.queued += 1;
            handle.set_slot(Slot::Queued { key });
            trace!(
                policy = %config.name(),
                task = %handle.id(),
                queued = state.entries.len(),
                "task queued"
            );
            return Ok(handle);
        }

        if config.falls_back_to_caller() {
            state.totals.run_inline += 1;
            handle.set_slot(Slot::Running);
            state.active.insert(handle.id(), handle.clone());
            drop(state);
            debug!(policy = %config.name(), task = %handle.id(), "queue full, running on submitter");
            self.inner.run_task(&handle, runnable);
            self.inner.finish_inline(&handle);
            return Ok(handle);
        }

        state.totals.rejected += 1;
        drop(state);
        let limit = config.queue_bound().limit().unwrap_or(usize::MAX);
        debug!(policy = %config.name(), limit, "task rejected");
        Err(Error::CapacityExceeded {
            policy: config.shared_name(),
            bound: MAX_QUEUE_SIZE,
            limit,
        })
    }

    /// Stops accepting tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.accepting {
            debug!(policy = %self.name(), "policy shutting down");
            state.accepting = false;
        }
        self.inner.drained.notify_all();
    }

    /// Stops accepting tasks, drains the queue and interrupts running tasks.
    ///
    /// Returns the handles of the drained tasks in queue order; none of them
    /// will run.
    pub fn shutdown_now(&self) -> Vec<TaskHandle> {
        let mut state = self.inner.state.lock();
        state.accepting = false;
        let mut drained = Vec::with_capacity(state.entries.len());
        while let Some(task) = state.pop_queued() {
            task.handle.set_slot(Slot::Cancelled);
            drained.push(task);
        }
        state.queue.clear();
        state.totals.cancelled += drained.len() as u64;
        let running: Vec<TaskHandle> = state.active.values().cloned().collect();
        self.inner.drained.notify_all();
        drop(state);

        debug!(
            policy = %self.name(),
            drained = drained.len(),
            interrupted = running.len(),
            "policy shut down immediately"
        );
        for handle in &running {
            handle.token().cancel(CancelReason::shutdown());
        }
        drained
            .into_iter()
            .map(|task| {
                task.runnable.discard(CancelReason::shutdown());
                task.handle
            })
            .collect()
    }

    /// Waits until the policy is shut down and idle.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        while !state.is_terminated() {
            let Some(deadline) = deadline else {
                self.inner.drained.wait(&mut state);
                continue;
            };
            if self
                .inner
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.is_terminated();
            }
        }
        true
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.inner.state.lock().accepting
    }

    /// Returns true once shut down with no queued or running tasks.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().is_terminated()
    }

    /// Returns current counters.
    #[must_use]
    pub fn metrics(&self) -> PolicyMetrics {
        let state = self.inner.state.lock();
        PolicyMetrics {
            running: state.active.len(),
            queued: state.entries.len(),
            total_admitted: state.totals.admitted,
            total_queued: state.totals.queued,
            total_rejected: state.totals.rejected,
            total_run_inline: state.totals.run_inline,
            total_cancelled: state.totals.cancelled,
            total_completed: state.totals.completed,
        }
    }
}

impl fmt::Debug for PolicyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyExecutor")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}
