//! Context registry capability.
//!
//! The registry resolves context type identifiers to providers. It is not a
//! global singleton: executors and propagators carry it explicitly, so two
//! executors can see entirely different sets of context types.

use super::provider::{ProviderHandle, ThreadContextProvider};
use super::slot::ContextSlot;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An immutable set of registered context providers.
///
/// Iteration order is sorted by context type, which fixes the order in which
/// snapshots are applied (and the reverse order in which they are restored).
#[derive(Clone, Default)]
pub struct ContextRegistry {
    providers: Arc<BTreeMap<Arc<str>, ProviderHandle>>,
}

impl ContextRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ContextRegistryBuilder {
        ContextRegistryBuilder::default()
    }

    /// Returns a registry with no context types.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves a context type identifier.
    #[must_use]
    pub fn resolve(&self, context_type: &str) -> Option<&ProviderHandle> {
        self.providers.get(context_type)
    }

    /// Returns true if the context type is registered.
    #[must_use]
    pub fn contains(&self, context_type: &str) -> bool {
        self.providers.contains_key(context_type)
    }

    /// Returns the registered context types in sorted order.
    pub fn context_types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(AsRef::as_ref)
    }

    /// Returns the number of registered context types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no context types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Arc<str>, &ProviderHandle)> {
        self.providers.iter()
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.context_types()).finish()
    }
}

/// Builder for [`ContextRegistry`].
#[derive(Default)]
pub struct ContextRegistryBuilder {
    providers: BTreeMap<Arc<str>, ProviderHandle>,
}

impl ContextRegistryBuilder {
    /// Registers a provider; a later registration of the same type replaces it.
    #[must_use]
    pub fn register(mut self, provider: Arc<dyn ThreadContextProvider>) -> Self {
        let context_type: Arc<str> = Arc::from(provider.context_type());
        self.providers
            .insert(context_type, ProviderHandle::new(provider));
        self
    }

    /// Registers a thread-local slot.
    #[must_use]
    pub fn slot<V>(self, slot: &ContextSlot<V>) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        self.register(slot.provider())
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self) -> ContextRegistry {
        ContextRegistry {
            providers: Arc::new(self.providers),
        }
    }
}

impl fmt::Debug for ContextRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistryBuilder")
            .field("context_types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_are_sorted_and_resolvable() {
        let security = ContextSlot::<String>::new("Security");
        let application = ContextSlot::<String>::new("Application");
        let registry = ContextRegistry::builder()
            .slot(&security)
            .slot(&application)
            .build();

        let types: Vec<&str> = registry.context_types().collect();
        assert_eq!(types, vec!["Application", "Security"]);
        assert!(registry.contains("Security"));
        assert!(registry.resolve("Transaction").is_none());
        assert_eq!(
            registry.resolve("Application").map(ProviderHandle::context_type),
            Some("Application")
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let first = ContextSlot::<u8>::new("Label");
        let second = ContextSlot::<u8>::new("Label");
        let registry = ContextRegistry::builder().slot(&first).slot(&second).build();
        assert_eq!(registry.len(), 1);
        assert!(ContextRegistry::empty().is_empty());
    }
}
