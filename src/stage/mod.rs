//! Managed completion stages.
//!
//! - [`managed`]: [`ManagedStage`], its status and direct completion operations
//! - [`algebra`]: the sealed [`CompletionStage`] trait (apply, accept, run,
//!   combine, either, compose, handle, when-complete, exceptionally)
//! - [`minimal`]: [`MinimalStage`], a composition-only view
//! - [`all_of`] / [`any_of`]: fan-in helpers

pub mod algebra;
mod cell;
pub(crate) mod dispatch;
pub mod managed;
pub mod minimal;

pub use algebra::CompletionStage;
pub use dispatch::{all_of, any_of};
pub use managed::{ManagedStage, StageStatus};
pub use minimal::MinimalStage;

use crate::types::Failure;

/// The published result of a stage.
pub type Outcome<T> = Result<T, Failure>;

mod sealed {
    use super::ManagedStage;

    pub trait Sealed<T> {
        fn stage(&self) -> &ManagedStage<T>;
    }
}
