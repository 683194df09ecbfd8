//! Captured thread context and scoped application.
//!
//! A [`ContextSnapshot`] is immutable once captured and may be applied any
//! number of times, on any thread. Applying it yields a [`ContextGuard`];
//! dropping the guard puts every touched context type back to the value it
//! held immediately before the apply, in reverse order. This holds on normal
//! return, early return, and panic unwind alike, and nests: restoring an inner
//! snapshot returns the thread to the enclosing snapshot's state.

use super::provider::{ContextValue, ProviderHandle};
use crate::error::ContextError;
use crate::tracing_compat::trace;
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// What a snapshot does with one context type.
#[derive(Clone)]
pub(crate) enum Captured {
    /// Install the captured value (`None` if the type was empty).
    Propagate(Option<ContextValue>),
    /// Install the empty state.
    Clear,
}

#[derive(Clone)]
pub(crate) struct SnapshotEntry {
    pub(crate) context_type: Arc<str>,
    pub(crate) provider: ProviderHandle,
    pub(crate) captured: Captured,
}

/// An immutable capture of thread context.
#[derive(Clone)]
pub struct ContextSnapshot {
    entries: Arc<[SnapshotEntry]>,
}

impl ContextSnapshot {
    pub(crate) fn from_entries(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Returns a snapshot that touches no context type.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    /// Returns the number of context types this snapshot touches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if applying this snapshot touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the context types this snapshot touches, in apply order.
    pub fn context_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.context_type.as_ref())
    }

    /// Returns true if the snapshot propagates a captured value for the type.
    #[must_use]
    pub fn propagates(&self, context_type: &str) -> bool {
        self.find(context_type)
            .is_some_and(|entry| matches!(entry.captured, Captured::Propagate(_)))
    }

    /// Returns true if the snapshot clears the type.
    #[must_use]
    pub fn clears(&self, context_type: &str) -> bool {
        self.find(context_type)
            .is_some_and(|entry| matches!(entry.captured, Captured::Clear))
    }

    fn find(&self, context_type: &str) -> Option<&SnapshotEntry> {
        self.entries
            .iter()
            .find(|entry| entry.context_type.as_ref() == context_type)
    }

    /// Applies the snapshot to the calling thread.
    ///
    /// If a provider fails part way, the types already applied are restored
    /// before the error is returned.
    pub fn apply(&self) -> Result<ContextGuard, ContextError> {
        let mut guard = ContextGuard {
            restore: SmallVec::new(),
            _not_send: PhantomData,
        };
        for entry in self.entries.iter() {
            let value = match &entry.captured {
                Captured::Propagate(value) => value.clone(),
                Captured::Clear => None,
            };
            match entry.provider.provider().apply(value) {
                Ok(prior) => guard.restore.push((entry.provider.clone(), prior)),
                Err(err) => {
                    trace!(context_type = %entry.context_type, "context apply failed, unwinding");
                    drop(guard);
                    return Err(ContextError::Apply {
                        context_type: Arc::clone(&entry.context_type),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(guard)
    }

    /// Runs `f` with the snapshot applied, restoring afterwards.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, ContextError> {
        let _guard = self.apply()?;
        Ok(f())
    }

    /// Binds `f` to this snapshot for repeated contextual calls.
    #[must_use]
    pub fn contextualize<F>(&self, f: F) -> Contextual<F> {
        Contextual {
            snapshot: self.clone(),
            f,
        }
    }
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.entries.iter() {
            let disposition = match entry.captured {
                Captured::Propagate(Some(_)) => "propagate",
                Captured::Propagate(None) => "propagate(empty)",
                Captured::Clear => "clear",
            };
            map.entry(&entry.context_type, &disposition);
        }
        map.finish()
    }
}

/// Restores the thread's prior context when dropped.
///
/// The guard is bound to the thread that applied the snapshot.
#[must_use = "dropping the guard immediately restores the prior context"]
pub struct ContextGuard {
    restore: SmallVec<[(ProviderHandle, Option<ContextValue>); 4]>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        while let Some((provider, prior)) = self.restore.pop() {
            provider.provider().restore(prior);
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("pending_restores", &self.restore.len())
            .finish()
    }
}

/// A function bound to a snapshot.
///
/// Every call applies the snapshot, runs the function, and restores.
#[derive(Clone)]
pub struct Contextual<F> {
    snapshot: ContextSnapshot,
    f: F,
}

impl<F> Contextual<F> {
    /// Returns the snapshot this function runs under.
    #[must_use]
    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    /// Calls the function under the captured context.
    pub fn call<R>(&self) -> Result<R, ContextError>
    where
        F: Fn() -> R,
    {
        let _guard = self.snapshot.apply()?;
        Ok((self.f)())
    }

    /// Calls the function with an argument under the captured context.
    pub fn call_with<A, R>(&self, arg: A) -> Result<R, ContextError>
    where
        F: Fn(A) -> R,
    {
        let _guard = self.snapshot.apply()?;
        Ok((self.f)(arg))
    }

    /// Consumes the wrapper and calls the function once.
    pub fn call_once<R>(self) -> Result<R, ContextError>
    where
        F: FnOnce() -> R,
    {
        let _guard = self.snapshot.apply()?;
        Ok((self.f)())
    }
}

impl<F> fmt::Debug for Contextual<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contextual")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}
