//! Declarative executor configuration.
//!
//! An [`ExecutorConfig`] holds optional settings that can come from code,
//! from `CONTEXTFLOW_*` environment variables, or (with the `config-file`
//! feature) from a TOML document. Precedence follows the usual layering:
//! values already set in code are overwritten by environment overrides when
//! [`ExecutorConfig::apply_env_overrides`] is called.
//!
//! | Variable | Setting | Example |
//! |----------|---------|---------|
//! | `CONTEXTFLOW_NAME` | executor name | `orders` |
//! | `CONTEXTFLOW_MAX_ASYNC` | concurrency bound | `4`, `-1` |
//! | `CONTEXTFLOW_MAX_QUEUED` | queue bound | `16`, `-1` |
//! | `CONTEXTFLOW_RUN_IF_QUEUE_FULL` | caller-runs fallback | `true` |
//! | `CONTEXTFLOW_MAX_POLICY` | `loose` or `strict` | `strict` |
//! | `CONTEXTFLOW_PROPAGATED` | comma-separated types | `Label,Remaining` |
//! | `CONTEXTFLOW_CLEARED` | comma-separated types | `Transaction` |
//! | `CONTEXTFLOW_UNCHANGED` | comma-separated types | `Security` |
//! | `CONTEXTFLOW_WORKER_THREADS` | dedicated pool size | `8` |
//! | `CONTEXTFLOW_THREAD_NAME_PREFIX` | dedicated pool name | `orders-worker` |

use crate::context::ContextRegistry;
use crate::error::ConfigError;
use crate::executor::{ManagedExecutor, ManagedExecutorBuilder};
use crate::policy::MaxPolicy;
use crate::runtime::ThreadPool;
use serde::Deserialize;
use std::sync::Arc;

/// Environment variable for the executor name.
pub const ENV_NAME: &str = "CONTEXTFLOW_NAME";
/// Environment variable for the concurrency bound.
pub const ENV_MAX_ASYNC: &str = "CONTEXTFLOW_MAX_ASYNC";
/// Environment variable for the queue bound.
pub const ENV_MAX_QUEUED: &str = "CONTEXTFLOW_MAX_QUEUED";
/// Environment variable for the caller-runs fallback.
pub const ENV_RUN_IF_QUEUE_FULL: &str = "CONTEXTFLOW_RUN_IF_QUEUE_FULL";
/// Environment variable for the max policy.
pub const ENV_MAX_POLICY: &str = "CONTEXTFLOW_MAX_POLICY";
/// Environment variable for the propagated context types.
pub const ENV_PROPAGATED: &str = "CONTEXTFLOW_PROPAGATED";
/// Environment variable for the cleared context types.
pub const ENV_CLEARED: &str = "CONTEXTFLOW_CLEARED";
/// Environment variable for the unchanged context types.
pub const ENV_UNCHANGED: &str = "CONTEXTFLOW_UNCHANGED";
/// Environment variable for the dedicated worker pool size.
pub const ENV_WORKER_THREADS: &str = "CONTEXTFLOW_WORKER_THREADS";
/// Environment variable for the dedicated worker pool thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "CONTEXTFLOW_THREAD_NAME_PREFIX";

const DEFAULT_NAME: &str = "contextflow";

/// Optional executor settings.
///
/// Unset fields keep the builder defaults: unbounded policy, rejection on a
/// full queue, loose max policy, all remaining context types propagated and
/// the process-wide shared worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Executor name, also used as the policy name.
    pub name: Option<String>,
    /// Concurrency bound (`-1` or at least 1).
    pub max_async: Option<i64>,
    /// Queue bound (`-1` or at least 1).
    pub max_queued: Option<i64>,
    /// Run on the submitter when the queue is full.
    pub run_if_queue_full: Option<bool>,
    /// Whether the caller-runs fallback may exceed `max_async`.
    pub max_policy: Option<MaxPolicy>,
    /// Context types to propagate.
    pub propagated: Option<Vec<String>>,
    /// Context types to clear.
    pub cleared: Option<Vec<String>>,
    /// Context types to leave unchanged.
    pub unchanged: Option<Vec<String>>,
    /// Size of a dedicated worker pool. Unset uses the shared pool.
    pub worker_threads: Option<usize>,
    /// Thread name prefix for a dedicated worker pool.
    pub thread_name_prefix: Option<String>,
}

impl ExecutorConfig {
    /// Applies `CONTEXTFLOW_*` environment variables on top of this config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the variable when a value
    /// cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the variable when a value
    /// cannot be parsed.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &str| {
            lookup(var)
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };

        if let Some(val) = read(ENV_NAME) {
            self.name = Some(val);
        }
        if let Some(val) = read(ENV_MAX_ASYNC) {
            self.max_async = Some(parse_i64(ENV_MAX_ASYNC, &val)?);
        }
        if let Some(val) = read(ENV_MAX_QUEUED) {
            self.max_queued = Some(parse_i64(ENV_MAX_QUEUED, &val)?);
        }
        if let Some(val) = read(ENV_RUN_IF_QUEUE_FULL) {
            self.run_if_queue_full = Some(parse_bool(ENV_RUN_IF_QUEUE_FULL, &val)?);
        }
        if let Some(val) = read(ENV_MAX_POLICY) {
            let policy = val
                .parse::<MaxPolicy>()
                .map_err(|_| invalid(ENV_MAX_POLICY, "loose or strict", &val))?;
            self.max_policy = Some(policy);
        }
        if let Some(val) = read(ENV_PROPAGATED) {
            self.propagated = Some(parse_list(&val));
        }
        if let Some(val) = read(ENV_CLEARED) {
            self.cleared = Some(parse_list(&val));
        }
        if let Some(val) = read(ENV_UNCHANGED) {
            self.unchanged = Some(parse_list(&val));
        }
        if let Some(val) = read(ENV_WORKER_THREADS) {
            self.worker_threads = Some(parse_usize(ENV_WORKER_THREADS, &val)?);
        }
        if let Some(val) = read(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = Some(val);
        }
        Ok(())
    }

    /// Starts a [`ManagedExecutorBuilder`] carrying these settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for an invalid bound.
    pub fn builder(&self, registry: ContextRegistry) -> Result<ManagedExecutorBuilder, ConfigError> {
        let name = self.name.as_deref().unwrap_or(DEFAULT_NAME);
        let mut builder = ManagedExecutor::builder(name).registry(registry);

        if let Some(value) = self.max_async {
            builder = builder.max_async(value)?;
        }
        if let Some(value) = self.max_queued {
            builder = builder.max_queued(value)?;
        }
        if let Some(enabled) = self.run_if_queue_full {
            builder = builder.run_if_queue_full(enabled);
        }
        if let Some(max_policy) = self.max_policy {
            builder = builder.max_policy(max_policy);
        }
        if let Some(types) = &self.propagated {
            builder = builder.propagated(types.iter().cloned());
        }
        if let Some(types) = &self.cleared {
            builder = builder.cleared(types.iter().cloned());
        }
        if let Some(types) = &self.unchanged {
            builder = builder.unchanged(types.iter().cloned());
        }
        if self.worker_threads.is_some() || self.thread_name_prefix.is_some() {
            let prefix = self
                .thread_name_prefix
                .clone()
                .unwrap_or_else(|| format!("{name}-worker"));
            let mut pool = ThreadPool::builder(prefix);
            if let Some(threads) = self.worker_threads {
                pool = pool.max_threads(threads);
            }
            builder = builder.pool(Arc::new(pool.build()));
        }
        Ok(builder)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the document is malformed
    /// or names an unknown key.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::InvalidValue {
            key: "toml".to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the path when the file
    /// cannot be read or parsed.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            key: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }
}

fn invalid(var: &str, expected: &str, val: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: var.to_string(),
        reason: format!("expected {expected}, got {val:?}"),
    }
}

fn parse_i64(var: &str, val: &str) -> Result<i64, ConfigError> {
    val.parse::<i64>().map_err(|_| invalid(var, "integer", val))
}

fn parse_usize(var: &str, val: &str) -> Result<usize, ConfigError> {
    val.parse::<usize>()
        .map_err(|_| invalid(var, "non-negative integer", val))
}

fn parse_bool(var: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, "true/false/1/0/yes/no/on/off", val)),
    }
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
