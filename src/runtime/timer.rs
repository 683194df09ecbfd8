//! Timer heap and timer thread for deadline-driven completion.
//!
//! This module provides a small min-heap of `(deadline, action)` pairs and a
//! process-wide [`Timer`] thread that fires due actions. Fired actions are
//! handed to the shared worker pool so a slow action never delays other
//! deadlines.

use super::pool::{ThreadPool, WorkerPool};
use super::task::Job;
use crate::tracing_compat::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

/// A min-heap of timed actions ordered by deadline.
///
/// Cancelled timers leave a stale heap entry that is skipped lazily.
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    actions: HashMap<u64, Job>,
    next_generation: u64,
}

impl TimerHeap {
    /// Creates a new empty timer heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no timers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Adds an action to run at `deadline`.
    pub fn insert(&mut self, deadline: Instant, action: Job) -> TimerKey {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            generation,
        });
        self.actions.insert(generation, action);
        TimerKey(generation)
    }

    /// Cancels a pending timer. Returns false if it already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.actions.remove(&key.0).is_some()
    }

    /// Returns the earliest pending deadline, if any.
    pub fn peek_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.actions.contains_key(&entry.generation) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops all actions whose deadline is `<= now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Job> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let generation = entry.generation;
            self.heap.pop();
            if let Some(action) = self.actions.remove(&generation) {
                expired.push(action);
            }
        }
        expired
    }
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("pending", &self.actions.len())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

struct TimerShared {
    heap: Mutex<TimerHeap>,
    changed: Condvar,
}

/// A background thread that fires scheduled actions.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

static GLOBAL_TIMER: OnceLock<Timer> = OnceLock::new();

impl Timer {
    /// Returns the process-wide timer, starting its thread on first use.
    pub fn global() -> &'static Self {
        GLOBAL_TIMER.get_or_init(|| {
            let timer = Self {
                shared: Arc::new(TimerShared {
                    heap: Mutex::new(TimerHeap::new()),
                    changed: Condvar::new(),
                }),
            };
            let shared = Arc::clone(&timer.shared);
            if let Err(err) = std::thread::Builder::new()
                .name("contextflow-timer".to_string())
                .spawn(move || timer_loop(&shared))
            {
                warn!(error = %err, "failed to start timer thread");
            }
            timer
        })
    }

    /// Runs `action` on a pool thread once `delay` has elapsed.
    ///
    /// Returns `None` without scheduling when the deadline lies beyond what
    /// [`Instant`] can represent; such an action could never fire.
    pub fn schedule(&self, delay: Duration, action: Job) -> Option<TimerKey> {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            trace!(delay_ms = delay.as_millis() as u64, "timer deadline unrepresentable, not scheduled");
            return None;
        };
        let key = self.shared.heap.lock().insert(deadline, action);
        self.shared.changed.notify_one();
        trace!(delay_ms = delay.as_millis() as u64, "timer scheduled");
        Some(key)
    }

    /// Cancels a scheduled action. Returns false if it already fired.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.shared.heap.lock().cancel(key)
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

fn timer_loop(shared: &TimerShared) {
    let pool = ThreadPool::shared();
    let mut heap = shared.heap.lock();
    loop {
        let due = heap.pop_expired(Instant::now());
        if !due.is_empty() {
            drop(heap);
            for action in due {
                if let Err(err) = pool.spawn(action) {
                    warn!(error = %err, "timer action dropped");
                }
            }
            heap = shared.heap.lock();
            continue;
        }
        match heap.peek_deadline() {
            Some(deadline) => {
                shared.changed.wait_until(&mut heap, deadline);
            }
            None => shared.changed.wait(&mut heap),
        }
    }
}
