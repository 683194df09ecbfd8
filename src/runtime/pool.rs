//! Worker pool used to run admitted actions.
//!
//! [`WorkerPool`] is the host-provided seam for OS thread management; the
//! policy layer only ever calls [`WorkerPool::spawn`]. [`ThreadPool`] is the
//! default implementation: an elastic pool that starts a thread whenever no
//! idle worker is available (up to a cap) and retires threads that stay idle
//! past a keep-alive interval.
//!
//! Elasticity matters here: admitted actions routinely block on each other
//! (an action waiting for a sibling stage), so a fixed-size pool could
//! deadlock below the policy's concurrency bound.

use super::task::Job;
use crate::error::Error;
use crate::tracing_compat::{debug, trace, warn};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Default cap on live worker threads.
pub const DEFAULT_MAX_THREADS: usize = 256;
/// Default idle time after which a worker thread exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Capability for running jobs on background threads.
pub trait WorkerPool: Send + Sync + fmt::Debug + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Runs `job` on some background thread.
    fn spawn(&self, job: Job) -> Result<(), Error>;
}

#[derive(Debug, Default)]
struct PoolState {
    live: usize,
    idle: usize,
    signalled: usize,
    shutdown: bool,
}

struct PoolInner {
    name: Arc<str>,
    queue: SegQueue<Job>,
    state: Mutex<PoolState>,
    work: Condvar,
    max_threads: usize,
    keep_alive: Duration,
    next_thread: AtomicUsize,
}

/// An elastic pool of OS threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

/// Builder for [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    name: String,
    max_threads: usize,
    keep_alive: Duration,
}

impl ThreadPoolBuilder {
    /// Caps the number of live threads (at least 1).
    #[must_use]
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    /// Sets how long an idle thread lingers before exiting.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Builds the pool. Threads start lazily on first spawn.
    #[must_use]
    pub fn build(self) -> ThreadPool {
        ThreadPool {
            inner: Arc::new(PoolInner {
                name: Arc::from(self.name),
                queue: SegQueue::new(),
                state: Mutex::new(PoolState::default()),
                work: Condvar::new(),
                max_threads: self.max_threads,
                keep_alive: self.keep_alive,
                next_thread: AtomicUsize::new(0),
            }),
        }
    }
}

static SHARED_POOL: OnceLock<ThreadPool> = OnceLock::new();

impl ThreadPool {
    /// Starts building a pool whose threads are named `{name}-{n}`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            name: name.into(),
            max_threads: DEFAULT_MAX_THREADS,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    /// Creates a pool with default limits.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Returns the process-wide pool used when no pool is configured.
    ///
    /// The shared pool is never shut down.
    #[must_use]
    pub fn shared() -> Self {
        SHARED_POOL
            .get_or_init(|| Self::new("contextflow-worker"))
            .clone()
    }

    /// Stops accepting jobs; queued jobs still run.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if !state.shutdown {
            debug!(pool = %self.inner.name, "thread pool shutting down");
            state.shutdown = true;
            self.inner.work.notify_all();
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.state.lock().live
    }

    fn start_worker(&self) -> std::io::Result<()> {
        let index = self.inner.next_thread.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name(format!("{}-{index}", self.inner.name))
            .spawn(move || worker_loop(&inner))
            .map(|_| ())
    }
}

impl WorkerPool for ThreadPool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues `job`, waking an idle worker or starting a new one.
    ///
    /// A failed thread start is tolerated while other workers are alive to
    /// drain the queue; with none left the job is refused.
    fn spawn(&self, job: Job) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(Error::Shutdown {
                executor: Arc::clone(&self.inner.name),
            });
        }
        if state.idle > state.signalled {
            state.signalled += 1;
            self.inner.work.notify_one();
        } else if state.live < self.inner.max_threads {
            // The new worker blocks on the state lock before it can go idle,
            // so it always sees the job pushed below.
            match self.start_worker() {
                Ok(()) => state.live += 1,
                Err(err) => {
                    warn!(pool = %self.inner.name, error = %err, live = state.live, "failed to start worker thread");
                    if state.live == 0 {
                        return Err(Error::WorkerStart {
                            pool: Arc::clone(&self.inner.name),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
        self.inner.queue.push(job);
        Ok(())
    }
}

fn run_job(pool: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!(pool = %pool, "job panicked on worker thread");
    }
}

fn worker_loop(inner: &PoolInner) {
    trace!(pool = %inner.name, "worker started");
    loop {
        while let Some(job) = inner.queue.pop() {
            run_job(&inner.name, job);
        }
        let mut state = inner.state.lock();
        if let Some(job) = inner.queue.pop() {
            drop(state);
            run_job(&inner.name, job);
            continue;
        }
        if state.shutdown {
            state.live -= 1;
            trace!(pool = %inner.name, "worker exiting after shutdown");
            return;
        }
        state.idle += 1;
        let timed_out = inner
            .work
            .wait_for(&mut state, inner.keep_alive)
            .timed_out();
        state.idle -= 1;
        if state.signalled > 0 {
            state.signalled -= 1;
            continue;
        }
        if timed_out && inner.queue.is_empty() {
            state.live -= 1;
            trace!(pool = %inner.name, "idle worker retired");
            return;
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("live", &state.live)
            .field("idle", &state.idle)
            .field("queued", &self.inner.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Latch, TEST_TIMEOUT, init_test_logging, wait_until};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_jobs_on_named_threads() {
        init_test_logging();
        crate::test_phase!("runs_jobs_on_named_threads");
        let pool = ThreadPool::new("unit-pool");
        let (tx, rx) = std::sync::mpsc::channel();
        pool.spawn(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).expect("send");
        }))
        .expect("spawn");
        let name = rx.recv_timeout(TEST_TIMEOUT).expect("job ran");
        assert!(name.is_some_and(|n| n.starts_with("unit-pool-")));
        crate::test_complete!("runs_jobs_on_named_threads");
    }

    #[test]
    fn blocked_jobs_do_not_starve_later_jobs() {
        init_test_logging();
        let pool = ThreadPool::new("elastic");
        let release = Latch::new(1);
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let release = release.clone();
            let started = Arc::clone(&started);
            pool.spawn(Box::new(move || {
                started.fetch_add(1, Ordering::SeqCst);
                release.wait_for(TEST_TIMEOUT);
            }))
            .expect("spawn");
        }
        assert!(wait_until(TEST_TIMEOUT, || started.load(Ordering::SeqCst) == 4));
        release.count_down();
    }

    #[test]
    fn panicking_job_does_not_kill_pool() {
        init_test_logging();
        let pool = ThreadPool::builder("panicky").max_threads(1).build();
        let explode = true;
        pool.spawn(Box::new(move || {
            if explode {
                panic!("boom");
            }
        }))
        .expect("spawn");
        let (tx, rx) = std::sync::mpsc::channel();
        pool.spawn(Box::new(move || tx.send(()).expect("send")))
            .expect("spawn");
        assert!(rx.recv_timeout(TEST_TIMEOUT).is_ok());
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        init_test_logging();
        let pool = ThreadPool::new("closing");
        pool.shutdown();
        assert!(pool.is_shutdown());
        let err = pool.spawn(Box::new(|| {})).expect_err("rejected");
        assert!(matches!(err, Error::Shutdown { .. }));
    }

    #[test]
    fn idle_workers_retire_after_keep_alive() {
        init_test_logging();
        let pool = ThreadPool::builder("retiring")
            .keep_alive(Duration::from_millis(20))
            .build();
        let (tx, rx) = std::sync::mpsc::channel();
        pool.spawn(Box::new(move || tx.send(()).expect("send")))
            .expect("spawn");
        rx.recv_timeout(TEST_TIMEOUT).expect("ran");
        assert!(wait_until(TEST_TIMEOUT, || pool.live_threads() == 0));
    }
}
