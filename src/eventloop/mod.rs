//! The event registration contract.
//!
//! An [`EventLoop`] is the seam between the resolution core and whatever
//! reactor the embedding application runs. The core never blocks and never
//! polls: it describes what it is waiting for with a [`Watcher`] and hands it
//! to the attached loop, which arms the matching reactor watches and invokes
//! the watcher's callbacks when they fire.
//!
//! # Operations
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`schedule_read`](EventLoop::schedule_read) | arm readiness and/or timeout |
//! | [`schedule_timeout`](EventLoop::schedule_timeout) | arm a timeout only |
//! | [`clear`](EventLoop::clear) | disarm and release reactor state |
//! | [`cleanup`](EventLoop::cleanup) | release the loop itself, once, on detach |
//!
//! # Masking
//!
//! A negative descriptor masks off the read callback and [`TIMEOUT_FOREVER`]
//! masks off the timeout callback. What is left after masking is armed; when
//! nothing is left the call succeeds without registering anything and the
//! watcher stays [`WatcherState::Unarmed`].

pub mod watcher;

pub use watcher::{EventCallback, ReactorHandle, UserArg, Watcher, WatcherState};

use crate::error::Result;
use crate::reactor::wall_now;
use crate::types::Time;

/// A file descriptor as seen by the reactor.
pub type Descriptor = i32;

/// Descriptor value meaning "no descriptor".
pub const INVALID_DESCRIPTOR: Descriptor = -1;

/// Timeout value meaning "never time out".
pub const TIMEOUT_FOREVER: u64 = u64::MAX;

/// Event registration contract implemented by every reactor binding.
///
/// Calls happen on the thread driving the reactor. Implementations must not
/// hold internal locks while invoking watcher callbacks, so that
/// [`clear`](Self::clear) can be called from inside a firing callback.
pub trait EventLoop: Send {
    /// Releases the binding. Called exactly once, when it is detached.
    ///
    /// # Errors
    ///
    /// Returns `ContractViolation` if watchers were still armed. The binding
    /// has stopped them by the time the error is returned.
    fn cleanup(self: Box<Self>) -> Result<()>;

    /// Arms a readiness watch on `fd` and/or a timeout after `timeout_ms`.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` if the watcher has no callbacks and `fd` is
    ///   negative, or if the watcher was already armed or cleared
    /// - `MemoryError` if per-watcher state could not be allocated; nothing
    ///   stays registered in that case
    fn schedule_read(&self, fd: Descriptor, timeout_ms: u64, watcher: &mut Watcher) -> Result<()>;

    /// Arms a timeout only. No readiness watch is ever armed.
    ///
    /// # Errors
    ///
    /// As for [`schedule_read`](Self::schedule_read).
    fn schedule_timeout(&self, timeout_ms: u64, watcher: &mut Watcher) -> Result<()> {
        self.schedule_read(INVALID_DESCRIPTOR, timeout_ms, watcher)
    }

    /// Disarms `watcher` and releases the binding's state for it.
    ///
    /// # Errors
    ///
    /// Clearing a watcher that is not armed is a caller bug and reports
    /// `ContractViolation`.
    fn clear(&self, watcher: &mut Watcher) -> Result<()>;

    /// Number of watchers currently armed through this loop.
    fn armed_count(&self) -> usize {
        0
    }

    /// Current time on the clock that drives this loop's timeouts.
    fn now(&self) -> Time {
        wall_now()
    }
}

impl std::fmt::Debug for dyn EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("armed", &self.armed_count())
            .finish()
    }
}
