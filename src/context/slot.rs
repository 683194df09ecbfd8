//! Typed thread-local context slots.
//!
//! A [`ContextSlot`] is a ready-made [`ThreadContextProvider`] backed by a
//! per-thread map. Hosts that keep their ambient state elsewhere implement the
//! provider trait directly instead.

use super::provider::{ContextValue, ProviderError, ThreadContextProvider};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SLOTS: RefCell<HashMap<u64, ContextValue>> = RefCell::new(HashMap::new());
}

fn swap_raw(slot: u64, value: Option<ContextValue>) -> Option<ContextValue> {
    SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        match value {
            Some(value) => slots.insert(slot, value),
            None => slots.remove(&slot),
        }
    })
}

fn read_raw(slot: u64) -> Option<ContextValue> {
    SLOTS.with(|slots| slots.borrow().get(&slot).cloned())
}

/// A named, typed piece of per-thread context.
pub struct ContextSlot<V> {
    id: u64,
    context_type: Arc<str>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for ContextSlot<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            context_type: Arc::clone(&self.context_type),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for ContextSlot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("id", &self.id)
            .field("context_type", &self.context_type)
            .finish()
    }
}

impl<V> ContextSlot<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a slot for the given context type identifier.
    #[must_use]
    pub fn new(context_type: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
            context_type: context_type.into(),
            _marker: PhantomData,
        }
    }

    /// Returns the context type identifier.
    #[must_use]
    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    /// Returns the calling thread's value.
    #[must_use]
    pub fn get(&self) -> Option<V> {
        read_raw(self.id).and_then(|value| value.downcast_ref::<V>().cloned())
    }

    /// Sets the calling thread's value, returning the previous one.
    pub fn set(&self, value: V) -> Option<V> {
        swap_raw(self.id, Some(Arc::new(value))).and_then(|prior| prior.downcast_ref::<V>().cloned())
    }

    /// Clears the calling thread's value, returning the previous one.
    pub fn clear(&self) -> Option<V> {
        swap_raw(self.id, None).and_then(|prior| prior.downcast_ref::<V>().cloned())
    }

    /// Returns this slot as a shareable provider capability.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn ThreadContextProvider> {
        Arc::new(self.clone())
    }
}

impl<V> ThreadContextProvider for ContextSlot<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn context_type(&self) -> &str {
        &self.context_type
    }

    fn capture(&self) -> Result<Option<ContextValue>, ProviderError> {
        Ok(read_raw(self.id))
    }

    fn apply(&self, value: Option<ContextValue>) -> Result<Option<ContextValue>, ProviderError> {
        Ok(swap_raw(self.id, value))
    }

    fn restore(&self, prior: Option<ContextValue>) {
        swap_raw(self.id, prior);
    }
}
