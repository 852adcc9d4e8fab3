//! Reference reactor binding.
//!
//! [`ReactorBinding`] implements [`EventLoop`] on top of any [`Reactor`]. Each
//! armed watcher owns one *armed pair* in the binding's [`TokenSlab`]: the ids
//! of its readiness watch and timer (either may be absent) plus clones of the
//! callbacks and user argument. The packed slab token travels through the
//! reactor as the per-watch [`Token`] and is stored in the watcher's
//! [`ReactorHandle`].
//!
//! ```text
//! Watcher ──handle──► TokenSlab[token] = ArmedPair { io, timer, callbacks }
//!                          ▲
//! Reactor watch ──Token────┘  (trampoline looks the pair up on fire)
//! ```
//!
//! Trampolines hold only a weak reference to the slab, so a watch that
//! outlives its binding fires into nothing. No binding lock is held while a
//! watcher callback runs.

use crate::config::LoopConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::eventloop::{
    Descriptor, EventCallback, EventLoop, ReactorHandle, UserArg, Watcher, WatcherState,
    TIMEOUT_FOREVER,
};
use crate::reactor::{Interest, Reactor, SlabToken, Token, TokenSlab, WatchCallback, WatchId};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::Time;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Binding-side state of one armed watcher.
struct ArmedPair {
    io: Option<WatchId>,
    /// `None` once the timer has fired; timers are one-shot.
    timer: Option<WatchId>,
    read: Option<EventCallback>,
    timeout: Option<EventCallback>,
    user_arg: UserArg,
}

struct BindingShared {
    slab: Mutex<TokenSlab<ArmedPair>>,
    max_watchers: usize,
}

impl BindingShared {
    fn fire_read(&self, token: Token) {
        let fired = {
            let slab = self.slab.lock();
            slab.get(SlabToken::from_u64(token.0)).and_then(|pair| {
                pair.read
                    .as_ref()
                    .map(|cb| (Arc::clone(cb), Arc::clone(&pair.user_arg)))
            })
        };
        match fired {
            Some((callback, arg)) => callback(&arg),
            None => trace!(token = token.0, "readiness for released watcher ignored"),
        }
    }

    fn fire_timeout(&self, token: Token) {
        let fired = {
            let mut slab = self.slab.lock();
            slab.get_mut(SlabToken::from_u64(token.0)).and_then(|pair| {
                pair.timer = None;
                pair.timeout
                    .as_ref()
                    .map(|cb| (Arc::clone(cb), Arc::clone(&pair.user_arg)))
            })
        };
        match fired {
            Some((callback, arg)) => callback(&arg),
            None => trace!(token = token.0, "timer for released watcher ignored"),
        }
    }
}

/// [`EventLoop`] implementation over a callback-driven [`Reactor`].
pub struct ReactorBinding<R: Reactor + ?Sized> {
    reactor: Arc<R>,
    shared: Arc<BindingShared>,
}

impl<R: Reactor + ?Sized> ReactorBinding<R> {
    /// Creates a binding with the default watcher limit.
    #[must_use]
    pub fn new(reactor: Arc<R>) -> Self {
        Self::with_config(reactor, &LoopConfig::default())
    }

    /// Creates a binding honouring `config.max_watchers`.
    #[must_use]
    pub fn with_config(reactor: Arc<R>, config: &LoopConfig) -> Self {
        Self {
            reactor,
            shared: Arc::new(BindingShared {
                slab: Mutex::new(TokenSlab::new()),
                max_watchers: config.max_watchers,
            }),
        }
    }

    /// Returns the reactor this binding drives.
    #[must_use]
    pub fn reactor(&self) -> &Arc<R> {
        &self.reactor
    }

    fn read_trampoline(&self) -> WatchCallback {
        let shared: Weak<BindingShared> = Arc::downgrade(&self.shared);
        Arc::new(move |token| {
            if let Some(shared) = shared.upgrade() {
                shared.fire_read(token);
            }
        })
    }

    fn timeout_trampoline(&self) -> WatchCallback {
        let shared: Weak<BindingShared> = Arc::downgrade(&self.shared);
        Arc::new(move |token| {
            if let Some(shared) = shared.upgrade() {
                shared.fire_timeout(token);
            }
        })
    }

    fn allocate(&self, watcher: &Watcher) -> Result<SlabToken> {
        let mut slab = self.shared.slab.lock();
        if slab.len() >= self.shared.max_watchers {
            return Err(Error::memory(format!(
                "watcher limit of {} reached",
                self.shared.max_watchers
            )));
        }
        Ok(slab.insert(ArmedPair {
            io: None,
            timer: None,
            read: watcher.read_callback().cloned(),
            timeout: watcher.timeout_callback().cloned(),
            user_arg: Arc::clone(watcher.user_arg()),
        }))
    }

    /// Starts the reactor watches for an allocated pair.
    ///
    /// On failure every watch this call started has been stopped again.
    fn start_watches(
        &self,
        slot: SlabToken,
        fd: Descriptor,
        timeout_ms: u64,
        watcher: &Watcher,
    ) -> Result<()> {
        let token = Token(slot.to_u64());

        let io = if watcher.has_read() {
            let id = self
                .reactor
                .start_io(fd, Interest::READABLE, token, self.read_trampoline())
                .map_err(Error::from_reactor)?;
            if let Some(pair) = self.shared.slab.lock().get_mut(slot) {
                pair.io = Some(id);
            }
            Some(id)
        } else {
            None
        };

        if watcher.has_timeout() {
            let started = self.reactor.start_timer(
                Duration::from_millis(timeout_ms),
                token,
                self.timeout_trampoline(),
            );
            match started {
                Ok(id) => {
                    if let Some(pair) = self.shared.slab.lock().get_mut(slot) {
                        pair.timer = Some(id);
                    }
                }
                Err(err) => {
                    if let Some(io) = io {
                        if let Err(stop_err) = self.reactor.stop_io(io) {
                            warn!(error = %stop_err, "failed to roll back readiness watch");
                        }
                    }
                    return Err(Error::from_reactor(err));
                }
            }
        }
        Ok(())
    }

    fn stop_pair(&self, pair: &ArmedPair) -> Result<()> {
        let mut first_err = None;
        if let Some(io) = pair.io {
            if let Err(err) = self.reactor.stop_io(io) {
                first_err.get_or_insert(Error::from_reactor(err));
            }
        }
        if let Some(timer) = pair.timer {
            if let Err(err) = self.reactor.stop_timer(timer) {
                first_err.get_or_insert(Error::from_reactor(err));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl<R: Reactor + ?Sized + 'static> EventLoop for ReactorBinding<R> {
    fn cleanup(self: Box<Self>) -> Result<()> {
        let leftover = self.shared.slab.lock().drain();
        if leftover.is_empty() {
            debug!("reactor binding released");
            return Ok(());
        }
        let count = leftover.len();
        for (_, pair) in &leftover {
            if let Err(err) = self.stop_pair(pair) {
                warn!(error = %err, "failed to stop watch during cleanup");
            }
        }
        warn!(count, "reactor binding cleaned up with armed watchers");
        Err(Error::contract_violation(format!(
            "{count} watchers still armed at cleanup"
        )))
    }

    fn schedule_read(&self, fd: Descriptor, timeout_ms: u64, watcher: &mut Watcher) -> Result<()> {
        match watcher.state() {
            WatcherState::Unarmed => {}
            WatcherState::Armed => {
                return Err(Error::invalid_parameter("watcher is already armed"));
            }
            WatcherState::Cleared => {
                return Err(Error::invalid_parameter("cleared watcher cannot be re-armed"));
            }
        }
        if watcher.is_empty() && fd < 0 {
            return Err(Error::invalid_parameter(
                "watcher has no callbacks and no descriptor",
            ));
        }

        if fd < 0 {
            watcher.mask_read();
        }
        if timeout_ms == TIMEOUT_FOREVER {
            watcher.mask_timeout();
        }
        if watcher.is_empty() {
            trace!(fd, "nothing left to arm after masking");
            return Ok(());
        }

        let slot = self.allocate(watcher)?;
        if let Err(err) = self.start_watches(slot, fd, timeout_ms, watcher) {
            self.shared.slab.lock().remove(slot);
            debug!(fd, timeout_ms, error = %err, "arming failed, nothing registered");
            return Err(err);
        }

        watcher.mark_armed(ReactorHandle::new(slot.to_u64()));
        trace!(
            fd,
            timeout_ms,
            read = watcher.has_read(),
            timeout = watcher.has_timeout(),
            token = slot.to_u64(),
            "watcher armed"
        );
        Ok(())
    }

    fn clear(&self, watcher: &mut Watcher) -> Result<()> {
        debug_assert!(
            watcher.state().is_armed(),
            "clear called on a watcher that is not armed"
        );
        if !watcher.state().is_armed() {
            warn!(state = ?watcher.state(), "clear called on a watcher that is not armed");
            return Err(Error::contract_violation("watcher is not armed"));
        }

        let handle = watcher.mark_cleared();
        let pair = handle.and_then(|h| self.shared.slab.lock().remove(SlabToken::from_u64(h.get())));
        let Some(pair) = pair else {
            warn!("armed watcher has no state in this binding");
            return Err(Error::contract_violation(
                "watcher was not armed through this binding",
            ));
        };
        trace!(
            io = pair.io.is_some(),
            timer = pair.timer.is_some(),
            "watcher cleared"
        );
        self.stop_pair(&pair)
    }

    fn armed_count(&self) -> usize {
        self.shared.slab.lock().len()
    }

    fn now(&self) -> Time {
        self.reactor.now()
    }
}

impl<R: Reactor + ?Sized> std::fmt::Debug for ReactorBinding<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorBinding")
            .field("armed", &self.shared.slab.lock().len())
            .field("max_watchers", &self.shared.max_watchers)
            .finish_non_exhaustive()
    }
}

/// Attaches `reactor` to `context` through a fresh [`ReactorBinding`].
///
/// Any binding already attached is detached and cleaned up first; its pending
/// operations complete with `Cancelled`.
///
/// # Errors
///
/// - `BadContext` if `context` is `None` or has been shut down
/// - `InvalidParameter` if `reactor` is `None`
/// - whatever detaching the previous binding reported; the context is left
///   with no event loop in that case
pub fn attach_reactor<R: Reactor + 'static>(
    context: Option<&Context>,
    reactor: Option<Arc<R>>,
) -> Result<()> {
    let Some(context) = context else {
        return Err(Error::bad_context("no context supplied"));
    };
    if context.is_shut_down() {
        return Err(Error::bad_context("context has been shut down"));
    }
    let Some(reactor) = reactor else {
        return Err(Error::invalid_parameter("no reactor supplied"));
    };
    let binding = ReactorBinding::with_config(reactor, context.config());
    context.attach_event_loop(Box::new(binding))
}
