//! The composition algebra shared by [`ManagedStage`] and [`MinimalStage`].
//!
//! Every operation comes in three forms:
//!
//! | Form | Context captured from | Runs on |
//! |------|-----------------------|---------|
//! | `then_apply` | the prior stage's facility, at call time | the completing thread, or the caller if the prior is already complete |
//! | `then_apply_async` | the prior stage's facility, at call time | a worker admitted by that facility's policy |
//! | `then_apply_async_on` | the given executor, if managed | the given executor |
//!
//! Context is captured when the combinator is called, never when the prior
//! completes. Dependents keep the prior stage's facility. Combinators that do
//! not handle failures fail the dependent with [`Failure::Completion`]
//! without running the action.
//!
//! [`MinimalStage`]: super::MinimalStage

use super::dispatch::{self, Mode, Side};
use super::managed::ManagedStage;
use super::sealed::Sealed;
use super::Outcome;
use crate::executor::Executor;
use crate::types::Failure;

/// Composition operations available on every stage reference.
///
/// This trait is sealed; it is implemented by [`ManagedStage`] and
/// [`MinimalStage`](super::MinimalStage).
pub trait CompletionStage<T: Clone + Send + 'static>: Sealed<T> {
    /// Applies `f` to the value once this stage succeeds.
    fn then_apply<U, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        then_apply(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`then_apply`](Self::then_apply).
    fn then_apply_async<U, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        then_apply(self.stage(), Mode::Default, f)
    }

    /// [`then_apply`](Self::then_apply) on `executor`.
    fn then_apply_async_on<U, F, E>(&self, f: F, executor: &E) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        E: Executor + Clone + 'static,
    {
        then_apply(self.stage(), Mode::on(executor), f)
    }

    /// Applies a fallible `f`; an `Err` becomes [`Failure::Task`].
    fn then_try_apply<U, E, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        then_try_apply(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`then_try_apply`](Self::then_try_apply).
    fn then_try_apply_async<U, E, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        then_try_apply(self.stage(), Mode::Default, f)
    }

    /// [`then_try_apply`](Self::then_try_apply) on `executor`.
    fn then_try_apply_async_on<U, E, F, X>(&self, f: F, executor: &X) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
        X: Executor + Clone + 'static,
    {
        then_try_apply(self.stage(), Mode::on(executor), f)
    }

    /// Passes the value to `f` once this stage succeeds.
    fn then_accept<F>(&self, f: F) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        then_apply(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`then_accept`](Self::then_accept).
    fn then_accept_async<F>(&self, f: F) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        then_apply(self.stage(), Mode::Default, f)
    }

    /// [`then_accept`](Self::then_accept) on `executor`.
    fn then_accept_async_on<F, E>(&self, f: F, executor: &E) -> ManagedStage<()>
    where
        F: FnOnce(T) + Send + 'static,
        E: Executor + Clone + 'static,
    {
        then_apply(self.stage(), Mode::on(executor), f)
    }

    /// Runs `f` once this stage succeeds.
    fn then_run<F>(&self, f: F) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        then_apply(self.stage(), Mode::Sync, move |_| f())
    }

    /// Async form of [`then_run`](Self::then_run).
    fn then_run_async<F>(&self, f: F) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        then_apply(self.stage(), Mode::Default, move |_| f())
    }

    /// [`then_run`](Self::then_run) on `executor`.
    fn then_run_async_on<F, E>(&self, f: F, executor: &E) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
        E: Executor + Clone + 'static,
    {
        then_apply(self.stage(), Mode::on(executor), move |_| f())
    }

    /// Combines both values once this stage and `other` succeed.
    ///
    /// If only one side is managed, its facility governs the result.
    fn then_combine<U, V, S, F>(&self, other: &S, f: F) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Sync, move |a, b| Ok(f(a, b)))
    }

    /// Async form of [`then_combine`](Self::then_combine).
    fn then_combine_async<U, V, S, F>(&self, other: &S, f: F) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Default, move |a, b| Ok(f(a, b)))
    }

    /// [`then_combine`](Self::then_combine) on `executor`.
    fn then_combine_async_on<U, V, S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) -> V + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::on(executor), move |a, b| {
            Ok(f(a, b))
        })
    }

    /// Passes both values to `f` once this stage and `other` succeed.
    fn then_accept_both<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Sync, move |a, b| {
            f(a, b);
            Ok(())
        })
    }

    /// Async form of [`then_accept_both`](Self::then_accept_both).
    fn then_accept_both_async<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Default, move |a, b| {
            f(a, b);
            Ok(())
        })
    }

    /// [`then_accept_both`](Self::then_accept_both) on `executor`.
    fn then_accept_both_async_on<U, S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T, U) + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::on(executor), move |a, b| {
            f(a, b);
            Ok(())
        })
    }

    /// Runs `f` once this stage and `other` succeed.
    fn run_after_both<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Sync, move |_, _| {
            f();
            Ok(())
        })
    }

    /// Async form of [`run_after_both`](Self::run_after_both).
    fn run_after_both_async<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::Default, move |_, _| {
            f();
            Ok(())
        })
    }

    /// [`run_after_both`](Self::run_after_both) on `executor`.
    fn run_after_both_async_on<U, S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_both(self.stage(), other.stage(), Mode::on(executor), move |_, _| {
            f();
            Ok(())
        })
    }

    /// Applies `f` to whichever of this stage and `other` completes first.
    ///
    /// If the first to complete failed, the result fails without running `f`.
    fn apply_to_either<U, S, F>(&self, other: &S, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Sync, move |side| Ok(f(either(side))))
    }

    /// Async form of [`apply_to_either`](Self::apply_to_either).
    fn apply_to_either_async<U, S, F>(&self, other: &S, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Default, move |side| {
            Ok(f(either(side)))
        })
    }

    /// [`apply_to_either`](Self::apply_to_either) on `executor`.
    fn apply_to_either_async_on<U, S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<T>,
        F: FnOnce(T) -> U + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::on(executor), move |side| {
            Ok(f(either(side)))
        })
    }

    /// Passes whichever value arrives first to `f`.
    fn accept_either<S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        S: CompletionStage<T>,
        F: FnOnce(T) + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Sync, move |side| {
            f(either(side));
            Ok(())
        })
    }

    /// Async form of [`accept_either`](Self::accept_either).
    fn accept_either_async<S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        S: CompletionStage<T>,
        F: FnOnce(T) + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Default, move |side| {
            f(either(side));
            Ok(())
        })
    }

    /// [`accept_either`](Self::accept_either) on `executor`.
    fn accept_either_async_on<S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<()>
    where
        S: CompletionStage<T>,
        F: FnOnce(T) + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::on(executor), move |side| {
            f(either(side));
            Ok(())
        })
    }

    /// Runs `f` once either this stage or `other` completes.
    fn run_after_either<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Sync, move |_| {
            f();
            Ok(())
        })
    }

    /// Async form of [`run_after_either`](Self::run_after_either).
    fn run_after_either_async<U, S, F>(&self, other: &S, f: F) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::Default, move |_| {
            f();
            Ok(())
        })
    }

    /// [`run_after_either`](Self::run_after_either) on `executor`.
    fn run_after_either_async_on<U, S, F, E>(&self, other: &S, f: F, executor: &E) -> ManagedStage<()>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce() + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach_either(self.stage(), other.stage(), Mode::on(executor), move |_| {
            f();
            Ok(())
        })
    }

    /// Chains a stage produced from the value.
    ///
    /// The result completes with the produced stage's outcome.
    fn then_compose<U, S, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        then_compose(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`then_compose`](Self::then_compose).
    fn then_compose_async<U, S, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        then_compose(self.stage(), Mode::Default, f)
    }

    /// [`then_compose`](Self::then_compose) on `executor`.
    fn then_compose_async_on<U, S, F, E>(&self, f: F, executor: &E) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        S: CompletionStage<U>,
        F: FnOnce(T) -> S + Send + 'static,
        E: Executor + Clone + 'static,
    {
        then_compose(self.stage(), Mode::on(executor), f)
    }

    /// Maps the outcome, successful or not, to a new value.
    ///
    /// This is the only combinator that can turn a failure into a success.
    fn handle<U, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        dispatch::attach(self.stage(), Mode::Sync, dispatch::always, move |outcome| Ok(f(outcome)))
    }

    /// Async form of [`handle`](Self::handle).
    fn handle_async<U, F>(&self, f: F) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        dispatch::attach(self.stage(), Mode::Default, dispatch::always, move |outcome| {
            Ok(f(outcome))
        })
    }

    /// [`handle`](Self::handle) on `executor`.
    fn handle_async_on<U, F, E>(&self, f: F, executor: &E) -> ManagedStage<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
        E: Executor + Clone + 'static,
    {
        dispatch::attach(self.stage(), Mode::on(executor), dispatch::always, move |outcome| {
            Ok(f(outcome))
        })
    }

    /// Observes the outcome without changing it.
    ///
    /// The result keeps this stage's value or failure. If `f` panics, the
    /// panic replaces the outcome as [`Failure::Panicked`], even when this
    /// stage had already failed.
    fn when_complete<F>(&self, f: F) -> ManagedStage<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        when_complete(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`when_complete`](Self::when_complete).
    fn when_complete_async<F>(&self, f: F) -> ManagedStage<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        when_complete(self.stage(), Mode::Default, f)
    }

    /// [`when_complete`](Self::when_complete) on `executor`.
    fn when_complete_async_on<F, E>(&self, f: F, executor: &E) -> ManagedStage<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
        E: Executor + Clone + 'static,
    {
        when_complete(self.stage(), Mode::on(executor), f)
    }

    /// Recovers from a failure; a success passes through without dispatch.
    fn exceptionally<F>(&self, f: F) -> ManagedStage<T>
    where
        F: FnOnce(Failure) -> T + Send + 'static,
    {
        exceptionally(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`exceptionally`](Self::exceptionally).
    fn exceptionally_async<F>(&self, f: F) -> ManagedStage<T>
    where
        F: FnOnce(Failure) -> T + Send + 'static,
    {
        exceptionally(self.stage(), Mode::Default, f)
    }

    /// [`exceptionally`](Self::exceptionally) on `executor`.
    fn exceptionally_async_on<F, E>(&self, f: F, executor: &E) -> ManagedStage<T>
    where
        F: FnOnce(Failure) -> T + Send + 'static,
        E: Executor + Clone + 'static,
    {
        exceptionally(self.stage(), Mode::on(executor), f)
    }

    /// Recovers from a failure with a stage produced from it.
    fn exceptionally_compose<S, F>(&self, f: F) -> ManagedStage<T>
    where
        S: CompletionStage<T>,
        F: FnOnce(Failure) -> S + Send + 'static,
    {
        exceptionally_compose(self.stage(), Mode::Sync, f)
    }

    /// Async form of [`exceptionally_compose`](Self::exceptionally_compose).
    fn exceptionally_compose_async<S, F>(&self, f: F) -> ManagedStage<T>
    where
        S: CompletionStage<T>,
        F: FnOnce(Failure) -> S + Send + 'static,
    {
        exceptionally_compose(self.stage(), Mode::Default, f)
    }

    /// [`exceptionally_compose`](Self::exceptionally_compose) on `executor`.
    fn exceptionally_compose_async_on<S, F, E>(&self, f: F, executor: &E) -> ManagedStage<T>
    where
        S: CompletionStage<T>,
        F: FnOnce(Failure) -> S + Send + 'static,
        E: Executor + Clone + 'static,
    {
        exceptionally_compose(self.stage(), Mode::on(executor), f)
    }
}

fn either<T>(side: Side<T, T>) -> T {
    match side {
        Side::Left(value) | Side::Right(value) => value,
    }
}

fn then_apply<T, U, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    dispatch::attach(prior, mode, dispatch::on_success, move |outcome| {
        outcome.map_err(Failure::propagated).map(f)
    })
}

fn then_try_apply<T, U, E, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(T) -> Result<U, E> + Send + 'static,
{
    dispatch::attach(prior, mode, dispatch::on_success, move |outcome| {
        outcome
            .map_err(Failure::propagated)
            .and_then(|value| f(value).map_err(Failure::task))
    })
}

fn then_compose<T, U, S, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    S: CompletionStage<U>,
    F: FnOnce(T) -> S + Send + 'static,
{
    dispatch::compose(prior, mode, dispatch::on_success, move |outcome| {
        outcome
            .map_err(Failure::propagated)
            .map(|value| f(value).stage().clone())
    })
}

fn when_complete<T, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(&Outcome<T>) + Send + 'static,
{
    dispatch::attach(prior, mode, dispatch::always, move |outcome| {
        f(&outcome);
        outcome.map_err(Failure::propagated)
    })
}

fn exceptionally<T, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(Failure) -> T + Send + 'static,
{
    dispatch::attach(prior, mode, dispatch::on_failure, move |outcome| {
        Ok(outcome.unwrap_or_else(f))
    })
}

fn exceptionally_compose<T, S, F>(prior: &ManagedStage<T>, mode: Mode, f: F) -> ManagedStage<T>
where
    T: Clone + Send + 'static,
    S: CompletionStage<T>,
    F: FnOnce(Failure) -> S + Send + 'static,
{
    let facility = prior.default_executor();
    dispatch::compose(prior, mode, dispatch::on_failure, move |outcome| match outcome {
        Ok(value) => {
            let stage = ManagedStage::with_facility(facility);
            stage.settle(Ok(value));
            Ok(stage)
        }
        Err(failure) => Ok(f(failure).stage().clone()),
    })
}
