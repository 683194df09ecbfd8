//! The managed executor: a concurrency policy plus a context propagator.

use super::Executor;
use crate::context::{
    ALL_REMAINING, ContextPropagator, ContextRegistry, ContextSnapshot, Contextual,
};
use crate::error::{ConfigError, ContextError, Error};
use crate::policy::{MaxPolicy, PolicyConfig, PolicyExecutor, TaskHandle};
use crate::runtime::{Runnable, ThreadPool, WorkerPool};
use crate::stage::dispatch;
use crate::stage::{ManagedStage, MinimalStage};
use crate::tracing_compat::debug;
use crate::types::Failure;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Who owns an executor's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Built by the caller, who may shut it down.
    #[default]
    User,
    /// Provided by the host; lifecycle calls are rejected.
    Container,
}

struct ManagedInner {
    name: Arc<str>,
    policy: PolicyExecutor,
    propagator: ContextPropagator,
    ownership: Ownership,
}

/// Runs actions under a concurrency policy with context propagation.
///
/// Root actions capture the caller's context at submission and return a
/// [`ManagedStage`] whose default facility is this executor. Cloning shares
/// the executor.
#[derive(Clone)]
pub struct ManagedExecutor {
    inner: Arc<ManagedInner>,
}

/// Builder for [`ManagedExecutor`].
///
/// Bound setters validate immediately; context sets are validated by
/// [`build`](Self::build).
pub struct ManagedExecutorBuilder {
    name: Arc<str>,
    registry: ContextRegistry,
    propagated: Vec<String>,
    cleared: Vec<String>,
    unchanged: Vec<String>,
    config: PolicyConfig,
    policy: Option<PolicyExecutor>,
    pool: Option<Arc<dyn WorkerPool>>,
    ownership: Ownership,
}

impl ManagedExecutorBuilder {
    fn new(name: Arc<str>) -> Self {
        Self {
            config: PolicyConfig::new(Arc::clone(&name)),
            name,
            registry: ContextRegistry::empty(),
            propagated: vec![ALL_REMAINING.to_string()],
            cleared: Vec::new(),
            unchanged: Vec::new(),
            policy: None,
            pool: None,
            ownership: Ownership::User,
        }
    }

    /// Sets the registry that resolves context types.
    #[must_use]
    pub fn registry(mut self, registry: ContextRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the propagated context types.
    #[must_use]
    pub fn propagated<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.propagated = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cleared context types.
    #[must_use]
    pub fn cleared<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cleared = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the context types left unchanged.
    #[must_use]
    pub fn unchanged<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unchanged = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the concurrency bound (`-1` for unbounded).
    pub fn max_async(mut self, value: i64) -> Result<Self, ConfigError> {
        self.config = self.config.max_concurrency(value)?;
        Ok(self)
    }

    /// Sets the queue bound (`-1` for unbounded).
    pub fn max_queued(mut self, value: i64) -> Result<Self, ConfigError> {
        self.config = self.config.max_queue_size(value)?;
        Ok(self)
    }

    /// Runs actions on the submitting thread when the queue is full.
    #[must_use]
    pub fn run_if_queue_full(mut self, enabled: bool) -> Self {
        self.config = self.config.run_if_queue_full(enabled);
        self
    }

    /// Sets the max policy.
    #[must_use]
    pub fn max_policy(mut self, max_policy: MaxPolicy) -> Self {
        self.config = self.config.max_policy(max_policy);
        self
    }

    /// Replaces the policy settings wholesale.
    #[must_use]
    pub fn policy_config(mut self, config: PolicyConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing policy instance instead of creating one.
    ///
    /// Bound settings on this builder are then ignored.
    #[must_use]
    pub fn policy(mut self, policy: PolicyExecutor) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the worker pool for a newly created policy.
    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets who owns the executor's lifecycle.
    #[must_use]
    pub fn ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Validates the context configuration and builds the executor.
    pub fn build(self) -> Result<ManagedExecutor, Error> {
        let propagator = ContextPropagator::builder(self.registry)
            .propagated(self.propagated)
            .cleared(self.cleared)
            .unchanged(self.unchanged)
            .build()?;
        let policy = match self.policy {
            Some(policy) => policy,
            None => {
                let pool = self
                    .pool
                    .unwrap_or_else(|| Arc::new(ThreadPool::shared()) as Arc<dyn WorkerPool>);
                PolicyExecutor::new(self.config, pool)
            }
        };
        debug!(
            executor = %self.name,
            policy = %policy.name(),
            propagator = ?propagator,
            "managed executor built"
        );
        Ok(ManagedExecutor {
            inner: Arc::new(ManagedInner {
                name: self.name,
                policy,
                propagator,
                ownership: self.ownership,
            }),
        })
    }
}

impl fmt::Debug for ManagedExecutorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedExecutorBuilder")
            .field("name", &self.name)
            .field("propagated", &self.propagated)
            .field("cleared", &self.cleared)
            .field("unchanged", &self.unchanged)
            .field("config", &self.config)
            .field("shared_policy", &self.policy.is_some())
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

impl ManagedExecutor {
    /// Starts building an executor. The name also names its policy.
    #[must_use]
    pub fn builder(name: impl Into<Arc<str>>) -> ManagedExecutorBuilder {
        ManagedExecutorBuilder::new(name.into())
    }

    /// Returns the executor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the governing policy.
    #[must_use]
    pub fn policy(&self) -> &PolicyExecutor {
        &self.inner.policy
    }

    /// Returns the context propagator.
    #[must_use]
    pub fn propagator(&self) -> &ContextPropagator {
        &self.inner.propagator
    }

    /// Returns the lifecycle owner.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        self.inner.ownership
    }

    /// Returns this executor as a stage facility.
    #[must_use]
    pub fn facility(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }

    /// Captures the calling thread's context.
    pub fn capture_context(&self) -> Result<ContextSnapshot, ContextError> {
        self.inner.propagator.capture()
    }

    /// Binds `f` to the calling thread's context.
    pub fn contextualize<F>(&self, f: F) -> Result<Contextual<F>, ContextError> {
        self.inner.propagator.contextualize(f)
    }

    /// Runs `supplier` asynchronously.
    ///
    /// A capture failure or a policy rejection fails the returned stage.
    pub fn supply_async<T, F>(&self, supplier: F) -> ManagedStage<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn_root(move || Ok(supplier()))
    }

    /// Runs a fallible `supplier`; an `Err` becomes [`Failure::Task`].
    pub fn try_supply_async<T, E, F>(&self, supplier: F) -> ManagedStage<T>
    where
        T: Clone + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.spawn_root(move || supplier().map_err(Failure::task))
    }

    /// Runs `action` asynchronously.
    pub fn run_async<F>(&self, action: F) -> ManagedStage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_root(move || {
            action();
            Ok(())
        })
    }

    fn spawn_root<T, W>(&self, work: W) -> ManagedStage<T>
    where
        T: Clone + Send + 'static,
        W: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        let stage = self.new_incomplete_stage();
        match self.capture_context() {
            Ok(snapshot) => dispatch::submit(self, &stage, Some(snapshot), work),
            Err(err) => dispatch::fail_capture(&stage, err),
        }
        stage
    }

    /// Runs `supplier` asynchronously, reporting a rejection to the caller.
    ///
    /// Unlike [`supply_async`](Self::supply_async), a capture failure or a
    /// full policy is returned as an error and no stage is created.
    pub fn submit<T, F>(&self, supplier: F) -> Result<ManagedStage<T>, Error>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let snapshot = self.capture_context()?;
        let stage = self.new_incomplete_stage();
        let runnable = dispatch::runnable(stage.clone(), Some(snapshot), move || Ok(supplier()));
        let task = self.inner.policy.submit(runnable)?;
        stage.cell.attach_task(task);
        Ok(stage)
    }

    /// Returns a stage already completed with `value`.
    #[must_use]
    pub fn completed_stage<T: Clone + Send + 'static>(&self, value: T) -> ManagedStage<T> {
        let stage = self.new_incomplete_stage();
        stage.settle(Ok(value));
        stage
    }

    /// Returns a stage already failed with `failure`.
    #[must_use]
    pub fn failed_stage<T: Clone + Send + 'static>(&self, failure: Failure) -> ManagedStage<T> {
        let stage = self.new_incomplete_stage();
        stage.settle(Err(failure));
        stage
    }

    /// Returns a placeholder stage governed by this executor.
    #[must_use]
    pub fn new_incomplete_stage<T: Clone + Send + 'static>(&self) -> ManagedStage<T> {
        ManagedStage::with_facility(self.facility())
    }

    /// Returns a composition-only view of a stage completed with `value`.
    #[must_use]
    pub fn minimal_completed_stage<T: Clone + Send + 'static>(&self, value: T) -> MinimalStage<T> {
        self.completed_stage(value).minimal_stage()
    }

    /// Returns a composition-only view of a stage failed with `failure`.
    #[must_use]
    pub fn minimal_failed_stage<T: Clone + Send + 'static>(&self, failure: Failure) -> MinimalStage<T> {
        self.failed_stage(failure).minimal_stage()
    }

    fn check_owned(&self, operation: &'static str) -> Result<(), Error> {
        match self.inner.ownership {
            Ownership::User => Ok(()),
            Ownership::Container => {
                debug!(executor = %self.name(), operation, "lifecycle call rejected");
                Err(Error::LifecycleViolation {
                    executor: Arc::clone(&self.inner.name),
                    operation,
                })
            }
        }
    }

    /// Stops accepting work; queued and running work still completes.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.check_owned("shutdown")?;
        self.inner.policy.shutdown();
        Ok(())
    }

    /// Stops accepting work, discards queued work and interrupts running work.
    ///
    /// Stages of discarded tasks are cancelled with a shutdown reason.
    /// Returns the discarded tasks in queue order.
    pub fn shutdown_now(&self) -> Result<Vec<TaskHandle>, Error> {
        self.check_owned("shutdownNow")?;
        Ok(self.inner.policy.shutdown_now())
    }

    /// Waits up to `timeout` for the executor to become idle after shutdown.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, Error> {
        self.check_owned("awaitTermination")?;
        Ok(self.inner.policy.await_termination(timeout))
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.policy.is_shutdown()
    }

    /// Returns true once shut down and idle.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.policy.is_terminated()
    }
}

impl Executor for ManagedExecutor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn execute(&self, runnable: Runnable) -> Result<Option<TaskHandle>, Error> {
        self.inner.policy.submit(runnable).map(Some)
    }

    fn propagator(&self) -> Option<&ContextPropagator> {
        Some(&self.inner.propagator)
    }

    fn policy_name(&self) -> Option<&str> {
        Some(self.inner.policy.name())
    }
}

impl fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("propagator", &self.inner.propagator)
            .field("ownership", &self.inner.ownership)
            .finish()
    }
}
