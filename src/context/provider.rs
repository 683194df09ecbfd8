//! Thread context provider capability.
//!
//! A provider owns one category of ambient per-thread state (a naming scope,
//! a security identity, an application classifier). The engine never touches
//! that state directly; it only calls `capture`, `apply`, and `restore`
//! through this seam.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque captured context value.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Error raised by a provider, reported with the context type attached.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Capability for one context type.
///
/// `None` stands for the empty state of the context type: capturing it yields
/// `None` when the thread has no value, and applying `None` clears the type.
pub trait ThreadContextProvider: Send + Sync + 'static {
    /// The context type identifier this provider serves.
    fn context_type(&self) -> &str;

    /// Reads the calling thread's current value.
    fn capture(&self) -> Result<Option<ContextValue>, ProviderError>;

    /// Installs `value` on the calling thread, returning the value it replaced.
    fn apply(&self, value: Option<ContextValue>) -> Result<Option<ContextValue>, ProviderError>;

    /// Reinstalls a value previously returned by [`apply`](Self::apply).
    ///
    /// Restoration runs on every exit path and therefore cannot fail.
    fn restore(&self, prior: Option<ContextValue>);
}

/// Shared handle to a provider capability.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<dyn ThreadContextProvider>,
}

impl ProviderHandle {
    /// Wraps a provider as a handle.
    #[must_use]
    pub fn new(inner: Arc<dyn ThreadContextProvider>) -> Self {
        Self { inner }
    }

    /// Returns the context type identifier.
    #[must_use]
    pub fn context_type(&self) -> &str {
        self.inner.context_type()
    }

    pub(crate) fn provider(&self) -> &dyn ThreadContextProvider {
        self.inner.as_ref()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("context_type", &self.context_type())
            .finish()
    }
}
