//! Thread context capture and propagation.
//!
//! Ambient per-thread state is modeled as an injected capability:
//!
//! - [`provider`]: the [`ThreadContextProvider`] seam (capture/apply/restore)
//! - [`slot`]: [`ContextSlot`], a typed thread-local provider
//! - [`registry`]: [`ContextRegistry`], the set of known context types
//! - [`propagator`]: [`ContextPropagator`], which decides per type whether to
//!   propagate, clear, or leave it alone
//! - [`snapshot`]: [`ContextSnapshot`] and the RAII [`ContextGuard`]

pub mod propagator;
pub mod provider;
pub mod registry;
pub mod slot;
pub mod snapshot;

pub use propagator::{ALL_REMAINING, ContextPropagator, ContextPropagatorBuilder};
pub use provider::{ContextValue, ProviderError, ProviderHandle, ThreadContextProvider};
pub use registry::{ContextRegistry, ContextRegistryBuilder};
pub use slot::ContextSlot;
pub use snapshot::{ContextGuard, ContextSnapshot, Contextual};

/// Context type identifier for the application component context.
pub const APPLICATION: &str = "Application";
/// Context type identifier for the security identity.
pub const SECURITY: &str = "Security";
/// Context type identifier for the transaction context.
pub const TRANSACTION: &str = "Transaction";
/// Context type identifier for the dependency-injection context.
pub const CDI: &str = "CDI";
