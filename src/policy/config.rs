//! Concurrency policy configuration.

use crate::error::ConfigError;
use crate::types::Bound;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static DEFAULT_POLICY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Setting name reported for the concurrency bound.
pub const MAX_ASYNC: &str = "maxAsync";
/// Setting name reported for the queue bound.
pub const MAX_QUEUED: &str = "maxQueued";

/// Whether the caller-runs fallback may exceed the concurrency bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxPolicy {
    /// A full queue with `run_if_queue_full` runs the action on the submitter.
    #[default]
    Loose,
    /// Never run more than `max_concurrency` actions; a full queue rejects.
    Strict,
}

impl FromStr for MaxPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loose" => Ok(Self::Loose),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "maxPolicy".to_string(),
                reason: format!("expected loose or strict, got {other:?}"),
            }),
        }
    }
}

impl fmt::Display for MaxPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loose => f.write_str("loose"),
            Self::Strict => f.write_str("strict"),
        }
    }
}

/// Admission rules for one policy instance.
///
/// Bounds are validated when set: `-1` is unbounded, anything else below 1
/// fails with [`ConfigError::OutOfRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    name: Arc<str>,
    max_concurrency: Bound,
    max_queue_size: Bound,
    run_if_queue_full: bool,
    max_policy: MaxPolicy,
}

impl PolicyConfig {
    /// Creates an unbounded, rejecting, loose policy with the given name.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            max_concurrency: Bound::Unbounded,
            max_queue_size: Bound::Unbounded,
            run_if_queue_full: false,
            max_policy: MaxPolicy::Loose,
        }
    }

    /// Sets the concurrency bound.
    pub fn max_concurrency(mut self, value: i64) -> Result<Self, ConfigError> {
        self.max_concurrency = Bound::from_setting(MAX_ASYNC, value)?;
        Ok(self)
    }

    /// Sets the queue bound.
    pub fn max_queue_size(mut self, value: i64) -> Result<Self, ConfigError> {
        self.max_queue_size = Bound::from_setting(MAX_QUEUED, value)?;
        Ok(self)
    }

    /// Runs actions on the submitting thread instead of rejecting them.
    #[must_use]
    pub fn run_if_queue_full(mut self, enabled: bool) -> Self {
        self.run_if_queue_full = enabled;
        self
    }

    /// Sets the max policy.
    #[must_use]
    pub fn max_policy(mut self, max_policy: MaxPolicy) -> Self {
        self.max_policy = max_policy;
        self
    }

    /// Returns the policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Returns the concurrency bound.
    #[must_use]
    pub const fn concurrency_bound(&self) -> Bound {
        self.max_concurrency
    }

    /// Returns the queue bound.
    #[must_use]
    pub const fn queue_bound(&self) -> Bound {
        self.max_queue_size
    }

    /// Returns true if a full queue falls back to the submitting thread.
    #[must_use]
    pub const fn runs_if_queue_full(&self) -> bool {
        self.run_if_queue_full
    }

    /// Returns the max policy.
    #[must_use]
    pub const fn max_policy_mode(&self) -> MaxPolicy {
        self.max_policy
    }

    /// Returns true if the caller-runs fallback is in effect.
    #[must_use]
    pub const fn falls_back_to_caller(&self) -> bool {
        self.run_if_queue_full && matches!(self.max_policy, MaxPolicy::Loose)
    }
}

impl Default for PolicyConfig {
    /// A fresh unbounded policy named `default-{n}`.
    fn default() -> Self {
        let n = DEFAULT_POLICY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("default-{n}"))
    }
}

impl fmt::Display for PolicyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "concurrencyPolicy[{}] maxAsync={} maxQueued={} runIfQueueFull={} maxPolicy={}",
            self.name,
            self.max_concurrency,
            self.max_queue_size,
            self.run_if_queue_full,
            self.max_policy
        )
    }
}
