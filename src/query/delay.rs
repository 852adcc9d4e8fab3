//! Pure-deadline operation.

use crate::eventloop::Descriptor;
use crate::scheduler::{Operation, Step, Wait};

/// Completes after a fixed number of milliseconds.
///
/// The output is the configured delay. Useful as a retry pause between
/// lookups and as the smallest possible scheduler client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay {
    ms: u64,
}

impl Delay {
    /// Creates a delay of `ms` milliseconds.
    #[must_use]
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Returns the delay in milliseconds.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.ms
    }
}

impl Operation for Delay {
    type Output = u64;

    fn start(&mut self) -> Step<u64> {
        Step::Wait(Wait::timeout(self.ms))
    }

    fn on_readable(&mut self, _fd: Descriptor) -> Step<u64> {
        // No descriptor is ever watched.
        Step::Wait(Wait::timeout(self.ms))
    }

    fn on_timeout(&mut self) -> Step<u64> {
        Step::done(self.ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::attach_reactor;
    use crate::context::Context;
    use crate::error::ErrorKind;
    use crate::eventloop::TIMEOUT_FOREVER;
    use crate::reactor::LabReactor;
    use crate::test_utils::init_test;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn delay_fires_at_deadline() {
        init_test("delay_fires_at_deadline");
        let context = Context::new();
        let reactor = Arc::new(LabReactor::new());
        attach_reactor(Some(&context), Some(Arc::clone(&reactor))).unwrap();

        let done = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&done);
        context
            .submit(Delay::new(250), move |_, result| *slot.lock() = Some(result))
            .unwrap();

        reactor.run_for(Duration::from_millis(249));
        crate::assert_with_log!(done.lock().is_none(), "not yet", true, done.lock().is_none());
        reactor.run_for(Duration::from_millis(1));
        let value = done.lock().take().map(|r| r.unwrap());
        crate::assert_with_log!(value == Some(250), "elapsed", Some(250u64), value);
        crate::assert_with_log!(
            reactor.active_io_watches() == 0,
            "never watched a descriptor",
            0usize,
            reactor.active_io_watches()
        );
        crate::test_complete!("delay_fires_at_deadline");
    }

    #[test]
    fn forever_delay_is_rejected() {
        init_test("forever_delay_is_rejected");
        let context = Context::new();
        attach_reactor(Some(&context), Some(Arc::new(LabReactor::new()))).unwrap();
        let kind = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&kind);
        context
            .submit(Delay::new(TIMEOUT_FOREVER), move |_, result| {
                *slot.lock() = result.err().map(|e| e.kind());
            })
            .unwrap();
        let kind = *kind.lock();
        crate::assert_with_log!(
            kind == Some(ErrorKind::InvalidParameter),
            "rejected",
            Some(ErrorKind::InvalidParameter),
            kind
        );
        crate::test_complete!("forever_delay_is_rejected");
    }
}
