//! Cancellation reason, kind, and token types.
//!
//! Cancelling a stage is a specialized failure. This module defines the types
//! that describe why cancellation occurred and the cooperative token used to
//! interrupt an action that is already running on a worker thread.
//!
//! Interruption is cooperative: cancelling a token sets a flag and unparks the
//! thread it is bound to. Long-running actions observe it through
//! [`is_interrupted`] or [`sleep_interruptibly`].

use core::fmt;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::Thread;
use std::time::{Duration, Instant};

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code.
    User,
    /// Cancellation due to a timeout.
    Timeout,
    /// Cancellation due to executor shutdown.
    Shutdown,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation, including kind and optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// Creates a new cancellation reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// Creates a timeout cancellation reason.
    #[must_use]
    pub const fn timeout() -> Self {
        Self::new(CancelKind::Timeout)
    }

    /// Creates a shutdown cancellation reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Returns true if this reason indicates shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Cooperative interruption
// ============================================================================

thread_local! {
    static CURRENT_TOKEN: RefCell<Option<CancelToken>> = const { RefCell::new(None) };
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    thread: Mutex<Option<Thread>>,
}

/// A cooperative cancellation signal shared between a task and its canceller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token bound to the current thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_TOKEN.with(|current| current.borrow().clone())
    }

    /// Cancels the token and unparks the thread it is bound to.
    ///
    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            *slot = Some(reason);
        }
        if let Some(thread) = self.inner.thread.lock().as_ref() {
            thread.unpark();
        }
        true
    }

    /// Returns true once the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.lock().clone()
    }

    /// Binds this token to the calling thread until the scope is dropped.
    pub(crate) fn enter(&self) -> TokenScope {
        *self.inner.thread.lock() = Some(std::thread::current());
        let previous = CURRENT_TOKEN.with(|current| current.replace(Some(self.clone())));
        TokenScope {
            token: self.clone(),
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previously bound token when dropped.
#[derive(Debug)]
pub(crate) struct TokenScope {
    token: CancelToken,
    previous: Option<CancelToken>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for TokenScope {
    fn drop(&mut self) {
        *self.token.inner.thread.lock() = None;
        let previous = self.previous.take();
        CURRENT_TOKEN.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

/// Returns true if the action running on this thread has been interrupted.
#[must_use]
pub fn is_interrupted() -> bool {
    CURRENT_TOKEN.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    })
}

/// Sleeps for `duration` unless the current action is interrupted first.
///
/// Returns false if the sleep was cut short by an interrupt.
pub fn sleep_interruptibly(duration: Duration) -> bool {
    let deadline = Instant::now().checked_add(duration);
    loop {
        if is_interrupted() {
            return false;
        }
        let Some(deadline) = deadline else {
            std::thread::park();
            continue;
        };
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::park_timeout(deadline - now);
    }
}
