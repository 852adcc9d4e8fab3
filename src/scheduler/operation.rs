//! Operations driven by the scheduler.
//!
//! An [`Operation`] is a small state machine. The scheduler calls
//! [`start`](Operation::start) once, then [`on_readable`](Operation::on_readable)
//! or [`on_timeout`](Operation::on_timeout) each time one of its watchers
//! fires. Every call answers with a [`Step`]: either wait again or finish.

use crate::error::{Error, Result};
use crate::eventloop::{Descriptor, TIMEOUT_FOREVER};
use crate::types::{OperationId, Time};
use std::time::Duration;

/// What an operation waits for next.
///
/// The first descriptor's watcher carries the timeout; any further
/// descriptors get read-only watchers. With no descriptors the wait is a pure
/// deadline.
///
/// A wait built with [`keep_deadline`](Self::keep_deadline) continues the
/// previous wait's deadline instead of starting a fresh timeout, so repeated
/// wakeups that lead nowhere cannot postpone it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wait {
    fds: Vec<Descriptor>,
    timeout_ms: u64,
    keep_deadline: bool,
}

impl Wait {
    /// Waits for `fd` to become readable, or `timeout_ms` to pass.
    #[must_use]
    pub fn readable(fd: Descriptor, timeout_ms: u64) -> Self {
        Self {
            fds: vec![fd],
            timeout_ms,
            keep_deadline: false,
        }
    }

    /// Waits for any of `fds` to become readable, or `timeout_ms` to pass.
    #[must_use]
    pub fn any_readable(fds: impl IntoIterator<Item = Descriptor>, timeout_ms: u64) -> Self {
        Self {
            fds: fds.into_iter().collect(),
            timeout_ms,
            keep_deadline: false,
        }
    }

    /// Waits for `timeout_ms` only.
    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            fds: Vec::new(),
            timeout_ms,
            keep_deadline: false,
        }
    }

    /// Descriptors to watch.
    #[must_use]
    pub fn fds(&self) -> &[Descriptor] {
        &self.fds
    }

    /// Continues the deadline of the wait this one replaces.
    ///
    /// `timeout_ms` then only applies when the previous wait had no finite
    /// deadline.
    #[must_use]
    pub fn keep_deadline(mut self) -> Self {
        self.keep_deadline = true;
        self
    }

    /// Timeout in milliseconds; [`TIMEOUT_FOREVER`] disables it.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Whether this wait continues the previous deadline.
    #[must_use]
    pub fn keeps_deadline(&self) -> bool {
        self.keep_deadline
    }

    /// Resolves the effective timeout at `now` and the deadline to remember.
    pub(crate) fn resolve(mut self, previous: Option<Time>, now: Time) -> (Self, Option<Time>) {
        if let (true, Some(deadline)) = (self.keep_deadline, previous) {
            let remaining = deadline.duration_since(now).as_nanos();
            self.timeout_ms = u64::try_from(remaining.div_ceil(1_000_000)).unwrap_or(u64::MAX);
            return (self, Some(deadline));
        }
        if self.timeout_ms == TIMEOUT_FOREVER {
            return (self, None);
        }
        let deadline = now + Duration::from_millis(self.timeout_ms);
        (self, Some(deadline))
    }

    /// Rejects waits that could never complete or name bad descriptors.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.fds.is_empty() && self.timeout_ms == TIMEOUT_FOREVER {
            return Err(Error::invalid_parameter(
                "wait has neither a descriptor nor a finite timeout",
            ));
        }
        if let Some(fd) = self.fds.iter().find(|fd| **fd < 0) {
            return Err(Error::invalid_parameter(format!(
                "cannot wait on negative descriptor {fd}"
            )));
        }
        Ok(())
    }
}

/// Outcome of one operation step.
#[derive(Debug)]
pub enum Step<T> {
    /// Park until the wait is satisfied.
    Wait(Wait),
    /// Finished; the result goes to the completion callback.
    Done(Result<T>),
}

impl<T> Step<T> {
    /// Finishes successfully.
    pub fn done(value: T) -> Self {
        Self::Done(Ok(value))
    }

    /// Finishes with `error`.
    pub fn fail(error: Error) -> Self {
        Self::Done(Err(error))
    }
}

/// An asynchronous lookup step machine.
pub trait Operation: Send + 'static {
    /// Value delivered on success.
    type Output: Send + 'static;

    /// First step, called right after submission.
    fn start(&mut self) -> Step<Self::Output>;

    /// `fd` became readable.
    fn on_readable(&mut self, fd: Descriptor) -> Step<Self::Output>;

    /// The current wait timed out.
    fn on_timeout(&mut self) -> Step<Self::Output>;

    /// The operation is being cancelled. Release resources here.
    fn on_cancel(&mut self) {}
}

/// Event that resumes a parked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Start,
    Readable(Descriptor),
    Timeout,
}

/// What a driver wants after running one step.
pub(crate) enum Progress {
    Wait(Wait),
    Done,
}

/// Type-erased operation plus its completion callback.
pub(crate) trait Driver: Send {
    /// Runs one step for `event`.
    fn resume(&mut self, event: Event) -> Progress;

    /// Records a cancellation, giving the operation a chance to clean up.
    fn cancel(&mut self, error: Error);

    /// Records a failure raised by the scheduler itself.
    fn fail(&mut self, error: Error);

    /// Delivers the recorded result to the completion callback.
    fn finish(self: Box<Self>, id: OperationId);
}

pub(crate) struct OpDriver<O: Operation, F> {
    op: O,
    on_complete: F,
    result: Option<Result<O::Output>>,
}

impl<O, F> OpDriver<O, F>
where
    O: Operation,
    F: FnOnce(OperationId, Result<O::Output>) + Send + 'static,
{
    pub(crate) fn new(op: O, on_complete: F) -> Self {
        Self {
            op,
            on_complete,
            result: None,
        }
    }
}

impl<O, F> Driver for OpDriver<O, F>
where
    O: Operation,
    F: FnOnce(OperationId, Result<O::Output>) + Send + 'static,
{
    fn resume(&mut self, event: Event) -> Progress {
        let step = match event {
            Event::Start => self.op.start(),
            Event::Readable(fd) => self.op.on_readable(fd),
            Event::Timeout => self.op.on_timeout(),
        };
        match step {
            Step::Wait(wait) => Progress::Wait(wait),
            Step::Done(result) => {
                self.result = Some(result);
                Progress::Done
            }
        }
    }

    fn cancel(&mut self, error: Error) {
        self.op.on_cancel();
        self.result = Some(Err(error));
    }

    fn fail(&mut self, error: Error) {
        self.result = Some(Err(error));
    }

    fn finish(self: Box<Self>, id: OperationId) {
        let result = self
            .result
            .unwrap_or_else(|| Err(Error::cancelled("operation retired without a result")));
        (self.on_complete)(id, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn pure_deadline_is_valid() {
        assert!(Wait::timeout(10).validate().is_ok());
        assert!(Wait::readable(3, TIMEOUT_FOREVER).validate().is_ok());
    }

    #[test]
    fn wait_forever_on_nothing_is_rejected() {
        let err = Wait::timeout(TIMEOUT_FOREVER).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn negative_descriptor_is_rejected() {
        let err = Wait::any_readable([3, -1], 10).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn fresh_wait_sets_deadline_from_now() {
        let now = Time::from_millis(40);
        let (wait, deadline) = Wait::readable(3, 100).resolve(Some(Time::from_millis(60)), now);
        assert_eq!(wait.timeout_ms(), 100);
        assert_eq!(deadline, Some(Time::from_millis(140)));

        let (_, deadline) = Wait::readable(3, TIMEOUT_FOREVER).resolve(None, now);
        assert_eq!(deadline, None);
    }

    #[test]
    fn kept_deadline_waits_only_for_the_remainder() {
        let previous = Some(Time::from_millis(100));
        let (wait, deadline) = Wait::readable(3, 100)
            .keep_deadline()
            .resolve(previous, Time::from_millis(60));
        assert_eq!(wait.timeout_ms(), 40);
        assert_eq!(deadline, previous);

        // Partial milliseconds round up; a passed deadline waits zero.
        let (wait, _) = Wait::readable(3, 100)
            .keep_deadline()
            .resolve(previous, Time::from_nanos(99_500_000));
        assert_eq!(wait.timeout_ms(), 1);
        let (wait, _) = Wait::readable(3, 100)
            .keep_deadline()
            .resolve(previous, Time::from_millis(150));
        assert_eq!(wait.timeout_ms(), 0);
    }

    #[test]
    fn kept_deadline_without_previous_starts_fresh() {
        let (wait, deadline) = Wait::readable(3, 25)
            .keep_deadline()
            .resolve(None, Time::from_millis(10));
        assert_eq!(wait.timeout_ms(), 25);
        assert_eq!(deadline, Some(Time::from_millis(35)));
    }

    #[test]
    fn step_helpers() {
        assert!(matches!(Step::done(1), Step::Done(Ok(1))));
        assert!(matches!(
            Step::<()>::fail(Error::cancelled("x")),
            Step::Done(Err(e)) if e.is_cancelled()
        ));
    }
}
