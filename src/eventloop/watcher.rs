//! The watcher record shared between the scheduler and a binding.
//!
//! A [`Watcher`] bundles the optional read and timeout callbacks of one
//! registration with the opaque user argument handed to whichever fires. The
//! binding stores its own bookkeeping in [`ReactorHandle`]; nothing else reads
//! it.
//!
//! # Lifecycle
//!
//! ```text
//! Unarmed ──schedule_read──► Armed ──clear──► Cleared
//!    │                                           ▲
//!    └── nothing to arm: stays Unarmed           └── terminal; never re-armed
//! ```
//!
//! Callbacks firing do not change the state. The scheduler clears the record
//! once it has consumed the event and builds a fresh one for the next wait.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque context passed to a watcher's callbacks.
pub type UserArg = Arc<dyn Any + Send + Sync>;

/// Callback invoked with the watcher's user argument.
pub type EventCallback = Arc<dyn Fn(&UserArg) + Send + Sync>;

/// Binding-private handle stored in an armed watcher.
///
/// The reference binding keeps a packed slab token here; other bindings may
/// use any `u64` encoding they like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactorHandle(u64);

impl ReactorHandle {
    /// Wraps a raw handle value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Registration state of a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Never armed, or a registration that had nothing to arm.
    Unarmed,
    /// Registered with a binding.
    Armed,
    /// Disarmed by `clear`. Terminal.
    Cleared,
}

impl WatcherState {
    /// Returns `true` if the watcher is registered with a binding.
    #[must_use]
    pub const fn is_armed(self) -> bool {
        matches!(self, Self::Armed)
    }
}

/// Per-registration bundle of callbacks and user context.
pub struct Watcher {
    read: Option<EventCallback>,
    timeout: Option<EventCallback>,
    user_arg: UserArg,
    handle: Option<ReactorHandle>,
    state: WatcherState,
}

impl Watcher {
    /// Creates a watcher with no callbacks.
    #[must_use]
    pub fn new(user_arg: UserArg) -> Self {
        Self {
            read: None,
            timeout: None,
            user_arg,
            handle: None,
            state: WatcherState::Unarmed,
        }
    }

    /// Sets the callback invoked when the descriptor becomes readable.
    #[must_use]
    pub fn with_read_callback(mut self, callback: EventCallback) -> Self {
        self.read = Some(callback);
        self
    }

    /// Sets the callback invoked when the timeout expires.
    #[must_use]
    pub fn with_timeout_callback(mut self, callback: EventCallback) -> Self {
        self.timeout = Some(callback);
        self
    }

    /// Returns the user argument.
    #[must_use]
    pub fn user_arg(&self) -> &UserArg {
        &self.user_arg
    }

    /// Returns the read callback, if any.
    #[must_use]
    pub fn read_callback(&self) -> Option<&EventCallback> {
        self.read.as_ref()
    }

    /// Returns the timeout callback, if any.
    #[must_use]
    pub fn timeout_callback(&self) -> Option<&EventCallback> {
        self.timeout.as_ref()
    }

    /// Returns `true` if a read callback is present.
    #[must_use]
    pub fn has_read(&self) -> bool {
        self.read.is_some()
    }

    /// Returns `true` if a timeout callback is present.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }

    /// Returns `true` if neither callback is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.timeout.is_none()
    }

    /// Drops the read callback. Used by bindings for a negative descriptor.
    pub fn mask_read(&mut self) {
        self.read = None;
    }

    /// Drops the timeout callback. Used by bindings for `TIMEOUT_FOREVER`.
    pub fn mask_timeout(&mut self) {
        self.timeout = None;
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Returns the binding handle while armed.
    #[must_use]
    pub fn reactor_handle(&self) -> Option<ReactorHandle> {
        self.handle
    }

    /// Records a successful registration.
    pub fn mark_armed(&mut self, handle: ReactorHandle) {
        self.handle = Some(handle);
        self.state = WatcherState::Armed;
    }

    /// Records a clear, returning the handle the binding stored.
    pub fn mark_cleared(&mut self) -> Option<ReactorHandle> {
        self.state = WatcherState::Cleared;
        self.handle.take()
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("read", &self.read.is_some())
            .field("timeout", &self.timeout.is_some())
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
