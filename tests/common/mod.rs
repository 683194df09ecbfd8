#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```

use contextflow::context::{ContextRegistry, ContextSlot};
use contextflow::executor::ManagedExecutor;
use contextflow::test_utils::Latch;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

pub use contextflow::test_utils::{TEST_TIMEOUT, wait_until};

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "CONTEXTFLOW_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Context slots registered by [`fixture_registry`].
#[derive(Debug, Clone)]
pub struct Slots {
    pub label: ContextSlot<String>,
    pub tenant: ContextSlot<u32>,
    pub transaction: ContextSlot<String>,
}

impl Slots {
    pub fn new() -> Self {
        Self {
            label: ContextSlot::new("Label"),
            tenant: ContextSlot::new("Tenant"),
            transaction: ContextSlot::new("Transaction"),
        }
    }

    pub fn registry(&self) -> ContextRegistry {
        ContextRegistry::builder()
            .slot(&self.label)
            .slot(&self.tenant)
            .slot(&self.transaction)
            .build()
    }

    pub fn clear_all(&self) {
        self.label.clear();
        self.tenant.clear();
        self.transaction.clear();
    }
}

/// Builds a managed executor with the given bounds and no registered context.
pub fn bounded_executor(name: &str, max_async: i64, max_queued: i64) -> ManagedExecutor {
    ManagedExecutor::builder(name)
        .max_async(max_async)
        .and_then(|builder| builder.max_queued(max_queued))
        .expect("valid bounds")
        .build()
        .expect("valid executor")
}

/// Returns an action that blocks until `latch` opens, counting `entered` down first.
pub fn blocking(entered: &Latch, release: &Latch) -> impl FnOnce() + Send + 'static {
    let entered = entered.clone();
    let release = release.clone();
    move || {
        entered.count_down();
        release.wait_for(TEST_TIMEOUT);
    }
}

/// Short pause used to let a pool pick up work that must not complete.
pub fn settle_briefly() {
    std::thread::sleep(Duration::from_millis(30));
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that a stage failed with a cancellation-rooted cause.
#[macro_export]
macro_rules! assert_cancelled {
    ($stage:expr) => {
        match $stage.join() {
            Err(failure) => assert!(
                failure.is_cancellation(),
                "expected cancellation-rooted failure, got {failure:?}"
            ),
            Ok(value) => panic!("expected cancellation, got value {value:?}"),
        }
    };
}
