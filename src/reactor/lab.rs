//! Deterministic lab reactor for testing.
//!
//! The [`LabReactor`] implements [`Reactor`] in virtual time. Nothing touches
//! the OS: descriptors are plain numbers, readiness is injected by the test,
//! and timers fire only when the test advances time.
//!
//! # Features
//!
//! - **Virtual time**: time advances only through [`advance_time`](LabReactor::advance_time)
//!   and [`run_for`](LabReactor::run_for)
//! - **Readiness injection**: [`inject_readable`](LabReactor::inject_readable) schedules
//!   a readiness edge for a descriptor at a delay from now
//! - **Deterministic**: firings due at the same instant are dispatched in the
//!   order they were scheduled
//! - **Allocation failure**: an optional watch limit makes `start_*` fail with
//!   `OutOfMemory`, exercising the all-or-nothing arming path
//!
//! Readiness is edge-like: an injected event is delivered once to every
//! readiness watch active on that descriptor at delivery time and is dropped
//! if there is none.
//!
//! # Example
//!
//! ```ignore
//! use dnsloop::reactor::{Interest, LabReactor, Reactor, Token};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let reactor = LabReactor::new();
//! reactor.start_timer(Duration::from_millis(50), Token::new(1), Arc::new(|t| {
//!     println!("timer {t:?} fired");
//! }))?;
//!
//! assert_eq!(reactor.run_for(Duration::from_millis(49)), 0);
//! assert_eq!(reactor.run_for(Duration::from_millis(1)), 1);
//! ```

use super::{Interest, Reactor, Token, WatchCallback, WatchId};
use crate::eventloop::Descriptor;
use crate::tracing_compat::{debug, trace};
use crate::types::Time;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BinaryHeap};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// A readiness edge waiting for delivery.
///
/// Ordered by delivery time, with sequence numbers breaking ties.
#[derive(Debug, PartialEq, Eq)]
struct Readiness {
    time: Time,
    sequence: u64,
    fd: Descriptor,
    ready: Interest,
}

impl PartialOrd for Readiness {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Readiness {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap: earliest time first, then by sequence for determinism
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchKind {
    Io { fd: Descriptor, interest: Interest },
    Timer { deadline: Time, sequence: u64 },
}

struct LabWatch {
    kind: WatchKind,
    token: Token,
    callback: WatchCallback,
}

impl std::fmt::Debug for LabWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabWatch")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// One firing selected for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    time: Time,
    sequence: u64,
    watch: WatchId,
}

/// Counters describing everything the lab reactor has done.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LabStats {
    /// Readiness watches started.
    pub io_started: u64,
    /// Readiness watches stopped.
    pub io_stopped: u64,
    /// Timers started.
    pub timers_started: u64,
    /// Timers stopped before firing.
    pub timers_stopped: u64,
    /// Readiness callbacks invoked.
    pub io_fired: u64,
    /// Timer callbacks invoked.
    pub timers_fired: u64,
    /// Injected readiness edges that found no watch.
    pub readiness_dropped: u64,
}

#[derive(Debug)]
struct LabInner {
    watches: BTreeMap<WatchId, LabWatch>,
    readiness: BinaryHeap<Readiness>,
    time: Time,
    next_watch: u64,
    /// Shared by readiness edges and timers so same-instant firings keep
    /// their scheduling order.
    next_sequence: u64,
    watch_limit: Option<usize>,
    stats: LabStats,
}

impl LabInner {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn next_watch_id(&mut self) -> WatchId {
        let id = WatchId::new(self.next_watch);
        self.next_watch += 1;
        id
    }

    fn check_capacity(&self) -> io::Result<()> {
        match self.watch_limit {
            Some(limit) if self.watches.len() >= limit => Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "lab reactor watch limit reached",
            )),
            _ => Ok(()),
        }
    }
}

/// A deterministic reactor for testing.
#[derive(Debug)]
pub struct LabReactor {
    inner: Mutex<LabInner>,
}

impl LabReactor {
    /// Creates a new lab reactor at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LabInner {
                watches: BTreeMap::new(),
                readiness: BinaryHeap::new(),
                time: Time::ZERO,
                next_watch: 0,
                next_sequence: 0,
                watch_limit: None,
                stats: LabStats::default(),
            }),
        }
    }

    /// Creates a lab reactor that refuses to hold more than `limit` watches.
    #[must_use]
    pub fn with_watch_limit(limit: usize) -> Self {
        let reactor = Self::new();
        reactor.set_watch_limit(Some(limit));
        reactor
    }

    /// Changes the watch limit; `None` removes it.
    pub fn set_watch_limit(&self, limit: Option<usize>) {
        self.inner.lock().watch_limit = limit;
    }

    /// Schedules a readable edge for `fd` after `delay`.
    pub fn inject_readable(&self, fd: Descriptor, delay: Duration) {
        self.inject(fd, Interest::READABLE, delay);
    }

    /// Makes `fd` readable on the next [`run_once`](Self::run_once).
    pub fn set_readable(&self, fd: Descriptor) {
        self.inject(fd, Interest::READABLE, Duration::ZERO);
    }

    /// Schedules a readiness edge with arbitrary flags for `fd` after `delay`.
    pub fn inject(&self, fd: Descriptor, ready: Interest, delay: Duration) {
        let mut inner = self.inner.lock();
        let time = inner.time + delay;
        let sequence = inner.next_sequence();
        inner.readiness.push(Readiness {
            time,
            sequence,
            fd,
            ready,
        });
    }

    /// Returns the current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.inner.lock().time
    }

    /// Returns the earliest pending readiness edge or timer deadline.
    #[must_use]
    pub fn next_event_time(&self) -> Option<Time> {
        let inner = self.inner.lock();
        let next_edge = inner.readiness.peek().map(|r| r.time);
        let next_timer = inner
            .watches
            .values()
            .filter_map(|w| match w.kind {
                WatchKind::Timer { deadline, .. } => Some(deadline),
                WatchKind::Io { .. } => None,
            })
            .min();
        match (next_edge, next_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Advances virtual time without dispatching anything.
    pub fn advance_time(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.time = inner.time + duration;
    }

    /// Advances virtual time to `target`; a target in the past is a no-op.
    pub fn advance_time_to(&self, target: Time) {
        let mut inner = self.inner.lock();
        if target > inner.time {
            inner.time = target;
        }
    }

    /// Dispatches every readiness edge and timer due at the current time.
    ///
    /// Returns the number of callbacks invoked. Watches stopped by an earlier
    /// callback in the same batch are skipped. Firings scheduled by a callback
    /// are left for the next call.
    pub fn run_once(&self) -> usize {
        let due = self.collect_due();
        let mut fired = 0;
        for item in due {
            let Some((token, callback)) = self.claim(item.watch) else {
                trace!(watch = item.watch.as_u64(), "skipping watch stopped during dispatch");
                continue;
            };
            callback(token);
            fired += 1;
        }
        fired
    }

    /// Runs the loop for `duration` of virtual time.
    ///
    /// Time jumps from one pending firing to the next, dispatching at each
    /// stop, and finally rests at `now + duration`.
    pub fn run_for(&self, duration: Duration) -> usize {
        let target = self.now() + duration;
        let mut fired = self.run_once();
        while let Some(next) = self.next_event_time() {
            if next > target {
                break;
            }
            self.advance_time_to(next);
            fired += self.run_once();
        }
        self.advance_time_to(target);
        fired
    }

    /// Returns the number of active readiness watches.
    #[must_use]
    pub fn active_io_watches(&self) -> usize {
        self.inner
            .lock()
            .watches
            .values()
            .filter(|w| matches!(w.kind, WatchKind::Io { .. }))
            .count()
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn active_timers(&self) -> usize {
        self.inner
            .lock()
            .watches
            .values()
            .filter(|w| matches!(w.kind, WatchKind::Timer { .. }))
            .count()
    }

    /// Returns true if a readiness watch is active on `fd`.
    #[must_use]
    pub fn is_watching(&self, fd: Descriptor) -> bool {
        self.inner
            .lock()
            .watches
            .values()
            .any(|w| matches!(w.kind, WatchKind::Io { fd: watched, .. } if watched == fd))
    }

    /// Returns a snapshot of the reactor's counters.
    #[must_use]
    pub fn stats(&self) -> LabStats {
        self.inner.lock().stats
    }

    fn collect_due(&self) -> Vec<Due> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = inner.time;
        let mut due = Vec::new();

        while inner.readiness.peek().is_some_and(|r| r.time <= now) {
            let Some(edge) = inner.readiness.pop() else {
                break;
            };
            let before = due.len();
            for (id, watch) in &inner.watches {
                if let WatchKind::Io { fd, interest } = watch.kind {
                    if fd == edge.fd && interest.intersects(edge.ready) {
                        due.push(Due {
                            time: edge.time,
                            sequence: edge.sequence,
                            watch: *id,
                        });
                    }
                }
            }
            if due.len() == before {
                inner.stats.readiness_dropped += 1;
                trace!(fd = edge.fd, "readiness edge dropped, no watch on descriptor");
            }
        }

        for (id, watch) in &inner.watches {
            if let WatchKind::Timer { deadline, sequence } = watch.kind {
                if deadline <= now {
                    due.push(Due {
                        time: deadline,
                        sequence,
                        watch: *id,
                    });
                }
            }
        }

        due.sort_unstable();
        due
    }

    fn claim(&self, id: WatchId) -> Option<(Token, WatchCallback)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let kind = inner.watches.get(&id)?.kind;
        match kind {
            WatchKind::Timer { .. } => {
                let watch = inner.watches.remove(&id)?;
                inner.stats.timers_fired += 1;
                Some((watch.token, watch.callback))
            }
            WatchKind::Io { .. } => {
                let watch = inner.watches.get(&id)?;
                inner.stats.io_fired += 1;
                Some((watch.token, Arc::clone(&watch.callback)))
            }
        }
    }
}

impl Default for LabReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for LabReactor {
    fn start_io(
        &self,
        fd: Descriptor,
        interest: Interest,
        token: Token,
        callback: WatchCallback,
    ) -> io::Result<WatchId> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative descriptor",
            ));
        }
        if interest.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty interest"));
        }
        let mut inner = self.inner.lock();
        inner.check_capacity()?;
        let id = inner.next_watch_id();
        inner.watches.insert(
            id,
            LabWatch {
                kind: WatchKind::Io { fd, interest },
                token,
                callback,
            },
        );
        inner.stats.io_started += 1;
        drop(inner);
        trace!(watch = id.as_u64(), fd, token = token.0, "lab readiness watch started");
        Ok(id)
    }

    fn stop_io(&self, watch: WatchId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.watches.get(&watch) {
            Some(LabWatch {
                kind: WatchKind::Io { .. },
                ..
            }) => {
                inner.watches.remove(&watch);
                inner.stats.io_stopped += 1;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "readiness watch not active",
            )),
        }
    }

    fn start_timer(
        &self,
        after: Duration,
        token: Token,
        callback: WatchCallback,
    ) -> io::Result<WatchId> {
        let mut inner = self.inner.lock();
        inner.check_capacity()?;
        let id = inner.next_watch_id();
        let deadline = inner.time + after;
        let sequence = inner.next_sequence();
        inner.watches.insert(
            id,
            LabWatch {
                kind: WatchKind::Timer { deadline, sequence },
                token,
                callback,
            },
        );
        inner.stats.timers_started += 1;
        drop(inner);
        debug!(
            watch = id.as_u64(),
            token = token.0,
            deadline = %deadline,
            "lab timer started"
        );
        Ok(id)
    }

    fn stop_timer(&self, watch: WatchId) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.watches.get(&watch) {
            Some(LabWatch {
                kind: WatchKind::Timer { .. },
                ..
            }) => {
                inner.watches.remove(&watch);
                inner.stats.timers_stopped += 1;
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "timer not active")),
        }
    }

    fn active_watches(&self) -> usize {
        self.inner.lock().watches.len()
    }

    fn now(&self) -> Time {
        self.inner.lock().time
    }
}
