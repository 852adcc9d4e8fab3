#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use dnsloop::{
    attach_reactor, Context, EventCallback, LabReactor, LoopConfig, UserArg, Watcher,
};
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "DNSLOOP_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "DNSLOOP_PROPTEST_MAX_SHRINK_ITERS";

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }

    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }

    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
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

/// Initialize logging and announce the test by name.
pub fn init_test(name: &str) {
    init_test_logging();
    crate::test_phase!(name);
}

/// A context with a fresh lab reactor attached through the reference binding.
pub fn attached_context() -> (Context, Arc<LabReactor>) {
    attached_context_with(LoopConfig::default())
}

/// Like [`attached_context`], with an explicit configuration.
pub fn attached_context_with(config: LoopConfig) -> (Context, Arc<LabReactor>) {
    let context = Context::with_config(config);
    let reactor = Arc::new(LabReactor::new());
    attach_reactor(Some(&context), Some(Arc::clone(&reactor)))
        .expect("attaching a lab reactor to a fresh context");
    (context, reactor)
}

/// Counts callback invocations and remembers the last `u64` user argument.
#[derive(Debug, Default)]
pub struct FireCounter {
    count: AtomicUsize,
    last_arg: Mutex<Option<u64>>,
}

impl FireCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_arg(&self) -> Option<u64> {
        *self.last_arg.lock()
    }

    pub fn callback(self: &Arc<Self>) -> EventCallback {
        let counter = Arc::clone(self);
        Arc::new(move |arg: &UserArg| {
            counter.count.fetch_add(1, Ordering::SeqCst);
            *counter.last_arg.lock() = arg.downcast_ref::<u64>().copied();
        })
    }
}

/// Builds a watcher with optional counting callbacks and a `u64` user argument.
pub fn counting_watcher(
    user_arg: u64,
    read: Option<&Arc<FireCounter>>,
    timeout: Option<&Arc<FireCounter>>,
) -> Watcher {
    let mut watcher = Watcher::new(Arc::new(user_arg));
    if let Some(counter) = read {
        watcher = watcher.with_read_callback(counter.callback());
    }
    if let Some(counter) = timeout {
        watcher = watcher.with_timeout_callback(counter.callback());
    }
    watcher
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
