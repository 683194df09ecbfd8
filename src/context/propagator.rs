//! Context propagator and its builder.
//!
//! A propagator sorts every registered context type into one of three
//! dispositions:
//!
//! | Set | Capture | Apply |
//! |-----|---------|-------|
//! | propagated | read the thread's value | install the captured value |
//! | cleared | nothing | install the empty state |
//! | unchanged | not recorded | not touched |
//!
//! [`ALL_REMAINING`] may appear in exactly one set and catches every
//! registered type the sets do not name. When no set names it, remaining
//! types are cleared.

use super::provider::ProviderHandle;
use super::registry::ContextRegistry;
use super::snapshot::{Captured, ContextSnapshot, Contextual, SnapshotEntry};
use crate::error::{ConfigError, ContextError};
use crate::tracing_compat::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Sentinel naming every context type not listed in another set.
pub const ALL_REMAINING: &str = "Remaining";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Propagate,
    Clear,
    Unchanged,
}

/// Builder for [`ContextPropagator`].
///
/// Each setter replaces the corresponding set. Duplicates within one set are
/// ignored. [`build`](Self::build) re-validates on every call.
#[derive(Clone)]
pub struct ContextPropagatorBuilder {
    registry: ContextRegistry,
    propagated: Vec<String>,
    cleared: Vec<String>,
    unchanged: Vec<String>,
}

fn collect<I, S>(types: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    types.into_iter().map(Into::into).collect()
}

impl ContextPropagatorBuilder {
    /// Creates a builder that propagates every registered type.
    #[must_use]
    pub fn new(registry: ContextRegistry) -> Self {
        Self {
            registry,
            propagated: vec![ALL_REMAINING.to_string()],
            cleared: Vec::new(),
            unchanged: Vec::new(),
        }
    }

    /// Sets the context types to propagate.
    #[must_use]
    pub fn propagated<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.propagated = collect(types);
        self
    }

    /// Sets the context types to clear.
    #[must_use]
    pub fn cleared<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cleared = collect(types);
        self
    }

    /// Sets the context types to leave unchanged.
    #[must_use]
    pub fn unchanged<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unchanged = collect(types);
        self
    }

    /// Returns the registry types are resolved against.
    #[must_use]
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Validates the configuration and builds a propagator.
    ///
    /// Overlap between sets is reported before unavailable types; each error
    /// names every offending type.
    pub fn build(&self) -> Result<ContextPropagator, ConfigError> {
        let propagated: BTreeSet<&str> = self.propagated.iter().map(String::as_str).collect();
        let cleared: BTreeSet<&str> = self.cleared.iter().map(String::as_str).collect();
        let unchanged: BTreeSet<&str> = self.unchanged.iter().map(String::as_str).collect();

        let mut membership: BTreeMap<&str, usize> = BTreeMap::new();
        for name in propagated.iter().chain(&cleared).chain(&unchanged) {
            *membership.entry(name).or_default() += 1;
        }
        let overlapping: Vec<String> = membership
            .into_iter()
            .filter(|(_, sets)| *sets > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        if !overlapping.is_empty() {
            debug!(types = ?overlapping, "overlapping context types");
            return Err(ConfigError::OverlappingContextTypes { types: overlapping });
        }

        let unavailable: Vec<String> = propagated
            .union(&cleared)
            .filter(|name| **name != ALL_REMAINING && !self.registry.contains(name))
            .map(|name| (*name).to_string())
            .collect();
        if !unavailable.is_empty() {
            debug!(types = ?unavailable, "unavailable context types");
            return Err(ConfigError::UnavailableContextTypes { types: unavailable });
        }

        let remaining = if propagated.contains(ALL_REMAINING) {
            Disposition::Propagate
        } else if unchanged.contains(ALL_REMAINING) {
            Disposition::Unchanged
        } else {
            Disposition::Clear
        };

        let mut plan = Vec::with_capacity(self.registry.len());
        let mut left_unchanged = Vec::new();
        for (context_type, provider) in self.registry.entries() {
            let name = context_type.as_ref();
            let disposition = if propagated.contains(name) {
                Disposition::Propagate
            } else if cleared.contains(name) {
                Disposition::Clear
            } else if unchanged.contains(name) {
                Disposition::Unchanged
            } else {
                remaining
            };
            if disposition == Disposition::Unchanged {
                left_unchanged.push(Arc::clone(context_type));
            } else {
                plan.push(PlanStep {
                    context_type: Arc::clone(context_type),
                    provider: provider.clone(),
                    disposition,
                });
            }
        }

        Ok(ContextPropagator {
            inner: Arc::new(PropagatorInner {
                plan,
                unchanged: left_unchanged,
            }),
        })
    }
}

impl fmt::Debug for ContextPropagatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPropagatorBuilder")
            .field("propagated", &self.propagated)
            .field("cleared", &self.cleared)
            .field("unchanged", &self.unchanged)
            .finish()
    }
}

struct PlanStep {
    context_type: Arc<str>,
    provider: ProviderHandle,
    disposition: Disposition,
}

struct PropagatorInner {
    plan: Vec<PlanStep>,
    unchanged: Vec<Arc<str>>,
}

/// Captures snapshots according to a validated configuration.
#[derive(Clone)]
pub struct ContextPropagator {
    inner: Arc<PropagatorInner>,
}

impl ContextPropagator {
    /// Starts building a propagator over `registry`.
    #[must_use]
    pub fn builder(registry: ContextRegistry) -> ContextPropagatorBuilder {
        ContextPropagatorBuilder::new(registry)
    }

    /// Captures the calling thread's context.
    pub fn capture(&self) -> Result<ContextSnapshot, ContextError> {
        let mut entries = Vec::with_capacity(self.inner.plan.len());
        for step in &self.inner.plan {
            let captured = match step.disposition {
                Disposition::Propagate => {
                    let value = step.provider.provider().capture().map_err(|err| {
                        ContextError::Capture {
                            context_type: Arc::clone(&step.context_type),
                            reason: err.to_string(),
                        }
                    })?;
                    Captured::Propagate(value)
                }
                Disposition::Clear | Disposition::Unchanged => Captured::Clear,
            };
            entries.push(SnapshotEntry {
                context_type: Arc::clone(&step.context_type),
                provider: step.provider.clone(),
                captured,
            });
        }
        trace!(entries = entries.len(), "captured context snapshot");
        Ok(ContextSnapshot::from_entries(entries))
    }

    /// Captures the calling thread's context and binds `f` to it.
    pub fn contextualize<F>(&self, f: F) -> Result<Contextual<F>, ContextError> {
        Ok(self.capture()?.contextualize(f))
    }

    /// Returns the registered types this propagator propagates.
    #[must_use]
    pub fn propagated_types(&self) -> Vec<&str> {
        self.types_with(Disposition::Propagate)
    }

    /// Returns the registered types this propagator clears.
    #[must_use]
    pub fn cleared_types(&self) -> Vec<&str> {
        self.types_with(Disposition::Clear)
    }

    /// Returns the registered types this propagator leaves alone.
    #[must_use]
    pub fn unchanged_types(&self) -> Vec<&str> {
        self.inner.unchanged.iter().map(AsRef::as_ref).collect()
    }

    fn types_with(&self, disposition: Disposition) -> Vec<&str> {
        self.inner
            .plan
            .iter()
            .filter(|step| step.disposition == disposition)
            .map(|step| step.context_type.as_ref())
            .collect()
    }
}

impl fmt::Debug for ContextPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPropagator")
            .field("propagated", &self.propagated_types())
            .field("cleared", &self.cleared_types())
            .field("unchanged", &self.unchanged_types())
            .finish()
    }
}
