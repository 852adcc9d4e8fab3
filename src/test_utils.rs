//! Test utilities shared by the unit tests.
//!
//! - Consistent tracing-based logging initialization
//! - Phase macros for readable test output
//! - Recording callbacks for watcher tests

use crate::eventloop::{EventCallback, UserArg, Watcher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
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

/// Counts how often a callback fired and remembers the last user argument.
#[derive(Debug, Default)]
pub struct FireCounter {
    count: AtomicUsize,
    last_arg: parking_lot::Mutex<Option<u64>>,
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

    /// Callback that bumps this counter; the user argument is expected to be a `u64`.
    pub fn callback(self: &Arc<Self>) -> EventCallback {
        let counter = Arc::clone(self);
        Arc::new(move |arg: &UserArg| {
            counter.count.fetch_add(1, Ordering::SeqCst);
            *counter.last_arg.lock() = arg.downcast_ref::<u64>().copied();
        })
    }
}

/// Builds a watcher with counting callbacks and a `u64` user argument.
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

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
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
