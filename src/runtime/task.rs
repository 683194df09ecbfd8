//! Runnable units of work.
//!
//! A [`Runnable`] pairs a type-erased closure with an optional cancellation
//! hook. Policy executors invoke the hook when they discard a task without
//! running it (cancelled while queued, or drained by an immediate shutdown);
//! plain pools ignore it.

use crate::types::CancelReason;
use std::fmt;

/// A type-erased closure run by a worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Invoked when a task is discarded before it runs.
pub type CancelHook = Box<dyn FnOnce(CancelReason) + Send + 'static>;

/// A unit of work submitted to an executor.
pub struct Runnable {
    run: Job,
    on_cancel: Option<CancelHook>,
}

impl Runnable {
    /// Creates a runnable from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            run: Box::new(f),
            on_cancel: None,
        }
    }

    /// Attaches a hook invoked if the runnable is discarded without running.
    #[must_use]
    pub fn on_cancel<H>(mut self, hook: H) -> Self
    where
        H: FnOnce(CancelReason) + Send + 'static,
    {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Runs the closure on the calling thread.
    pub fn run(self) {
        (self.run)();
    }

    /// Discards the closure and fires the cancellation hook.
    pub fn discard(self, reason: CancelReason) {
        if let Some(hook) = self.on_cancel {
            hook(reason);
        }
    }

    pub(crate) fn into_parts(self) -> (Job, Option<CancelHook>) {
        (self.run, self.on_cancel)
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("has_cancel_hook", &self.on_cancel.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_invokes_closure_not_hook() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (r, c) = (Arc::clone(&ran), Arc::clone(&cancelled));
        Runnable::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discard_fires_hook_with_reason() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&seen);
        Runnable::new(|| unreachable!("discarded runnable must not run"))
            .on_cancel(move |reason| *slot.lock() = Some(reason))
            .discard(CancelReason::shutdown());
        assert_eq!(*seen.lock(), Some(CancelReason::shutdown()));
    }
}
