//! A stage reference restricted to the composition algebra.

use super::managed::ManagedStage;
use super::{CompletionStage, sealed};
use std::fmt;

/// A view of a [`ManagedStage`] that can only be composed.
///
/// It offers no way to read, complete, cancel or obtrude the underlying
/// stage; whoever holds the full reference still can. Stages created from a
/// minimal stage are ordinary [`ManagedStage`]s.
pub struct MinimalStage<T> {
    inner: ManagedStage<T>,
}

impl<T> Clone for MinimalStage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> MinimalStage<T> {
    pub(crate) fn new(inner: ManagedStage<T>) -> Self {
        Self { inner }
    }

    /// Returns a full stage that completes with this stage's outcome.
    ///
    /// The copy is a dependent; completing or cancelling it does not touch
    /// the underlying stage.
    #[must_use]
    pub fn to_stage(&self) -> ManagedStage<T> {
        self.inner.copy()
    }
}

impl<T: Clone + Send + 'static> sealed::Sealed<T> for MinimalStage<T> {
    fn stage(&self) -> &ManagedStage<T> {
        &self.inner
    }
}

impl<T: Clone + Send + 'static> CompletionStage<T> for MinimalStage<T> {}

impl<T: Clone + Send + 'static> fmt::Debug for MinimalStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinimalStage")
            .field("id", &self.inner.id())
            .finish_non_exhaustive()
    }
}
