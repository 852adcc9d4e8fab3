//! External reactor interface.
//!
//! The resolver never owns a reactor; the embedding application does. This
//! module describes the capabilities a reactor must expose for the reference
//! [`ReactorBinding`](crate::binding::ReactorBinding) to drive it:
//!
//! | Capability | Method |
//! |------------|--------|
//! | readiness watch on a descriptor with a callback | [`Reactor::start_io`] |
//! | one-shot relative timer with a callback | [`Reactor::start_timer`] |
//! | stop either | [`Reactor::stop_io`], [`Reactor::stop_timer`] |
//! | per-watch opaque user data | the [`Token`] passed back to the callback |
//! | monotonic clock | [`Reactor::now`] |
//!
//! The reactor runs its own loop. When a watch fires it invokes the stored
//! [`WatchCallback`] with the watch's token; it must not hold internal locks
//! while doing so, because the callback may stop or start other watches.
//!
//! # Key Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Reactor`] | Trait for external readiness/timer reactors |
//! | [`Interest`] | Readiness flags for descriptor watches |
//! | [`Token`] | Per-watch user data handed back on fire |
//! | [`WatchId`] | Reactor-issued handle used to stop a watch |
//! | [`TokenSlab`] | Generation-checked slab bindings use to resolve tokens |
//! | [`LabReactor`] | Deterministic virtual-time reactor for tests |

pub mod interest;
pub mod lab;
pub mod token;

pub use interest::Interest;
pub use lab::{LabReactor, LabStats};
pub use token::{SlabToken, TokenSlab};

use crate::eventloop::Descriptor;
use crate::types::Time;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Wall-clock monotonic time, measured from the first call in this process.
#[must_use]
pub fn wall_now() -> Time {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Time::from_nanos(u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
}

/// Per-watch user data stored in the reactor and handed back on fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl Token {
    /// Creates a new token.
    #[must_use]
    pub const fn new(val: u64) -> Self {
        Self(val)
    }
}

/// Handle issued by a reactor for one started watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    /// Creates a watch id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Callback a reactor invokes when a watch fires.
pub type WatchCallback = Arc<dyn Fn(Token) + Send + Sync>;

/// A readiness/timer reactor supplied by the embedding application.
///
/// Readiness watches stay active until stopped. Timers are one-shot: once a
/// timer has fired it is no longer active and must not be stopped again.
///
/// # Errors
///
/// Start methods report `io::ErrorKind::OutOfMemory` when the reactor cannot
/// hold another watch and `io::ErrorKind::InvalidInput` for a bad descriptor
/// or empty interest. Stop methods report `io::ErrorKind::NotFound` for a
/// watch that is not active.
pub trait Reactor: Send + Sync {
    /// Starts a readiness watch on `fd`.
    fn start_io(
        &self,
        fd: Descriptor,
        interest: Interest,
        token: Token,
        callback: WatchCallback,
    ) -> io::Result<WatchId>;

    /// Stops a readiness watch.
    fn stop_io(&self, watch: WatchId) -> io::Result<()>;

    /// Starts a one-shot timer firing after `after`.
    fn start_timer(
        &self,
        after: Duration,
        token: Token,
        callback: WatchCallback,
    ) -> io::Result<WatchId>;

    /// Stops a timer that has not fired yet.
    fn stop_timer(&self, watch: WatchId) -> io::Result<()>;

    /// Returns the number of active watches of both kinds.
    fn active_watches(&self) -> usize;

    /// Returns `true` if nothing is being watched.
    fn is_empty(&self) -> bool {
        self.active_watches() == 0
    }

    /// Current time on the clock that drives this reactor's timers.
    ///
    /// Reactors on virtual time must override this.
    fn now(&self) -> Time {
        wall_now()
    }
}
