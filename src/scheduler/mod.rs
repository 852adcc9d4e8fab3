//! Query scheduler.
//!
//! The scheduler owns every pending operation together with the watchers it
//! armed for it, and it owns the attached [`EventLoop`]. It is the only code
//! that arms or clears watchers, and the only code that attaches or detaches
//! an event loop.
//!
//! # Dispatch
//!
//! ```text
//! reactor fires ─► binding trampoline ─► route_read / route_timeout
//!                                            │
//!        lock: check epoch, take driver, clear every watcher of the op
//!                                            │
//!        unlocked: operation.on_readable / on_timeout
//!                                            │
//!        Wait ─► lock: arm fresh watchers    Done ─► completion callback
//! ```
//!
//! Each arming gets a new epoch. A watcher's user argument records the epoch
//! it was armed under, so a callback from a superseded arming is ignored.
//!
//! The scheduler remembers the deadline of each finite wait, read from the
//! loop's [`now`](EventLoop::now). A [`Wait::keep_deadline`] re-arms with
//! only the time left until that deadline.
//!
//! # Locking
//!
//! One `parking_lot` mutex guards the scheduler state, the attached loop
//! included. Operation steps and completion callbacks always run with it
//! released, so they may submit, cancel, or detach freely. Bindings must not
//! invoke watcher callbacks from inside `schedule_read` or `clear`.

pub mod operation;

pub use operation::{Operation, Step, Wait};

use crate::error::{Error, Result};
use crate::eventloop::{
    Descriptor, EventCallback, EventLoop, UserArg, Watcher, TIMEOUT_FOREVER,
};
use crate::reactor::wall_now;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{OperationId, Time};
use operation::{Driver, Event, OpDriver, Progress};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// One pending operation.
struct OpSlot {
    /// `None` while a step of the operation is running.
    driver: Option<Box<dyn Driver>>,
    watchers: Vec<Watcher>,
    epoch: u64,
    /// Deadline of the current wait, if it has a finite timeout.
    deadline: Option<Time>,
    cancel_requested: bool,
}

struct SchedState {
    event_loop: Option<Box<dyn EventLoop>>,
    ops: BTreeMap<OperationId, OpSlot>,
    next_id: u64,
    next_epoch: u64,
    closed: bool,
}

struct SchedulerInner {
    state: Mutex<SchedState>,
}

/// User argument of every watcher the scheduler arms.
#[derive(Debug)]
struct WakeTarget {
    scheduler: Weak<SchedulerInner>,
    op: OperationId,
    epoch: u64,
    fd: Option<Descriptor>,
}

fn route_read(arg: &UserArg) {
    if let Some(target) = arg.downcast_ref::<WakeTarget>() {
        match target.fd {
            Some(fd) => target.wake(Event::Readable(fd)),
            None => trace!(op = %target.op, "readiness on a deadline-only watcher"),
        }
    }
}

fn route_timeout(arg: &UserArg) {
    if let Some(target) = arg.downcast_ref::<WakeTarget>() {
        target.wake(Event::Timeout);
    }
}

impl WakeTarget {
    fn wake(&self, event: Event) {
        if let Some(inner) = self.scheduler.upgrade() {
            QueryScheduler { inner }.dispatch(self.op, self.epoch, event);
        }
    }
}

/// Clears every watcher in `watchers`, logging failures.
fn clear_all(event_loop: Option<&dyn EventLoop>, watchers: Vec<Watcher>) {
    let Some(event_loop) = event_loop else {
        if !watchers.is_empty() {
            warn!(count = watchers.len(), "watchers outlived their event loop");
        }
        return;
    };
    for mut watcher in watchers {
        if let Err(err) = event_loop.clear(&mut watcher) {
            warn!(error = %err, "failed to clear watcher");
        }
    }
}

/// Owner of pending operations and of the attached event loop.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct QueryScheduler {
    inner: Arc<SchedulerInner>,
}

impl QueryScheduler {
    /// Creates a scheduler with no event loop attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedState {
                    event_loop: None,
                    ops: BTreeMap::new(),
                    next_id: 1,
                    next_epoch: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Installs `event_loop`, detaching and cleaning up any previous one.
    ///
    /// # Errors
    ///
    /// `BadContext` after [`close`](Self::close); otherwise whatever the
    /// previous loop's cleanup reported, in which case nothing is attached.
    pub fn attach(&self, event_loop: Box<dyn EventLoop>) -> Result<()> {
        loop {
            self.detach()?;
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::bad_context("scheduler is closed"));
            }
            // A completion callback run by detach may have attached a loop.
            if state.event_loop.is_none() {
                state.event_loop = Some(event_loop);
                debug!("event loop attached");
                return Ok(());
            }
        }
    }

    /// Cancels every pending operation, then cleans up the attached loop.
    ///
    /// Pending operations complete with `Cancelled`. Detaching with nothing
    /// attached is a no-op.
    ///
    /// # Errors
    ///
    /// Whatever the loop's [`cleanup`](EventLoop::cleanup) reported. The loop
    /// is detached either way.
    pub fn detach(&self) -> Result<()> {
        let (event_loop, cancelled) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(event_loop) = state.event_loop.take() else {
                return Ok(());
            };
            let mut cancelled = Vec::new();
            let ids: Vec<OperationId> = state.ops.keys().copied().collect();
            for id in ids {
                let Some(slot) = state.ops.get_mut(&id) else {
                    continue;
                };
                clear_all(Some(event_loop.as_ref()), std::mem::take(&mut slot.watchers));
                if slot.driver.is_some() {
                    if let Some(slot) = state.ops.remove(&id) {
                        if let Some(driver) = slot.driver {
                            cancelled.push((id, driver));
                        }
                    }
                } else {
                    // Mid-step; cancelled once the step returns.
                    slot.cancel_requested = true;
                }
            }
            (event_loop, cancelled)
        };

        debug!(cancelled = cancelled.len(), "detaching event loop");
        let cleaned = event_loop.cleanup();
        for (id, mut driver) in cancelled {
            driver.cancel(Error::cancelled("event loop detached"));
            driver.finish(id);
        }
        cleaned
    }

    /// Returns `true` if an event loop is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().event_loop.is_some()
    }

    /// Refuses further submissions and detaches the event loop.
    ///
    /// # Errors
    ///
    /// As for [`detach`](Self::detach).
    pub fn close(&self) -> Result<()> {
        self.inner.state.lock().closed = true;
        self.detach()
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Submits an operation.
    ///
    /// `on_complete` runs exactly once, with no scheduler lock held. It may
    /// run before `submit` returns if the operation finishes or fails in its
    /// first step.
    ///
    /// # Errors
    ///
    /// `BadContext` if the scheduler is closed or has no event loop; the
    /// operation is dropped without running in that case.
    pub fn submit<O, F>(&self, op: O, on_complete: F) -> Result<OperationId>
    where
        O: Operation,
        F: FnOnce(OperationId, Result<O::Output>) + Send + 'static,
    {
        let id = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::bad_context("scheduler is closed"));
            }
            if state.event_loop.is_none() {
                return Err(Error::bad_context("no event loop attached"));
            }
            let id = OperationId::new(state.next_id);
            state.next_id += 1;
            state.ops.insert(
                id,
                OpSlot {
                    driver: None,
                    watchers: Vec::new(),
                    epoch: 0,
                    deadline: None,
                    cancel_requested: false,
                },
            );
            id
        };
        debug!(op = %id, "operation submitted");
        self.drive(id, Box::new(OpDriver::new(op, on_complete)), Event::Start);
        Ok(id)
    }

    /// Cancels a pending operation.
    ///
    /// Its watchers are cleared, [`Operation::on_cancel`] runs, and its
    /// completion callback receives `Cancelled`. Called from inside one of
    /// the operation's own steps, the cancel takes effect when the step
    /// returns, unless that step finished the operation.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `id` is not pending.
    pub fn cancel(&self, id: OperationId) -> Result<()> {
        let driver = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(slot) = state.ops.get_mut(&id) else {
                return Err(Error::invalid_parameter(format!(
                    "operation {id} is not pending"
                )));
            };
            if slot.driver.is_none() {
                slot.cancel_requested = true;
                trace!(op = %id, "cancel deferred until current step returns");
                return Ok(());
            }
            let Some(slot) = state.ops.remove(&id) else {
                return Ok(());
            };
            clear_all(state.event_loop.as_deref(), slot.watchers);
            slot.driver
        };
        if let Some(mut driver) = driver {
            debug!(op = %id, "operation cancelled");
            driver.cancel(Error::cancelled("operation cancelled"));
            driver.finish(id);
        }
        Ok(())
    }

    /// Number of operations that have not completed yet.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().ops.len()
    }

    /// Number of watchers armed through the attached loop.
    #[must_use]
    pub fn armed_watchers(&self) -> usize {
        self.inner
            .state
            .lock()
            .event_loop
            .as_ref()
            .map_or(0, |event_loop| event_loop.armed_count())
    }

    fn dispatch(&self, id: OperationId, epoch: u64, event: Event) {
        let driver = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(slot) = state.ops.get_mut(&id) else {
                trace!(op = %id, "event for retired operation ignored");
                return;
            };
            if slot.epoch != epoch || slot.driver.is_none() {
                trace!(op = %id, epoch, current = slot.epoch, "stale event ignored");
                return;
            }
            clear_all(state.event_loop.as_deref(), std::mem::take(&mut slot.watchers));
            slot.driver.take()
        };
        if let Some(driver) = driver {
            trace!(op = %id, ?event, "resuming operation");
            self.drive(id, driver, event);
        }
    }

    /// Runs one step of `driver` and parks or retires the operation.
    fn drive(&self, id: OperationId, mut driver: Box<dyn Driver>, event: Event) {
        let progress = driver.resume(event);

        let retire = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let cancel_requested = state.ops.get(&id).map_or(true, |slot| slot.cancel_requested);
            match progress {
                Progress::Done => {
                    state.ops.remove(&id);
                    None
                }
                Progress::Wait(_) if cancel_requested => {
                    state.ops.remove(&id);
                    Some(Error::cancelled("operation cancelled"))
                }
                Progress::Wait(wait) => {
                    let epoch = state.next_epoch;
                    state.next_epoch += 1;
                    let now = state.event_loop.as_deref().map_or_else(wall_now, |l| l.now());
                    let previous = state.ops.get(&id).and_then(|slot| slot.deadline);
                    let (wait, deadline) = wait.resolve(previous, now);
                    match self.arm(state.event_loop.as_deref(), id, epoch, &wait) {
                        Ok(watchers) => match state.ops.get_mut(&id) {
                            Some(slot) => {
                                slot.watchers = watchers;
                                slot.epoch = epoch;
                                slot.deadline = deadline;
                                slot.driver = Some(driver);
                                trace!(
                                    op = %id,
                                    epoch,
                                    timeout_ms = wait.timeout_ms(),
                                    "operation parked"
                                );
                                return;
                            }
                            None => {
                                clear_all(state.event_loop.as_deref(), watchers);
                                Some(Error::cancelled("operation cancelled"))
                            }
                        },
                        Err(err) => {
                            state.ops.remove(&id);
                            debug!(op = %id, error = %err, "arming failed");
                            driver.fail(err);
                            None
                        }
                    }
                }
            }
        };

        if let Some(err) = retire {
            driver.cancel(err);
        }
        debug!(op = %id, "operation retired");
        driver.finish(id);
    }

    /// Arms the watchers for `wait`, all or nothing.
    fn arm(
        &self,
        event_loop: Option<&dyn EventLoop>,
        op: OperationId,
        epoch: u64,
        wait: &Wait,
    ) -> Result<Vec<Watcher>> {
        let Some(event_loop) = event_loop else {
            return Err(Error::bad_context("no event loop attached"));
        };
        wait.validate()?;

        let target = |fd: Option<Descriptor>| -> UserArg {
            Arc::new(WakeTarget {
                scheduler: Arc::downgrade(&self.inner),
                op,
                epoch,
                fd,
            })
        };
        let read_cb: EventCallback = Arc::new(route_read);
        let timeout_cb: EventCallback = Arc::new(route_timeout);

        if wait.fds().is_empty() {
            let mut watcher =
                Watcher::new(target(None)).with_timeout_callback(Arc::clone(&timeout_cb));
            event_loop.schedule_timeout(wait.timeout_ms(), &mut watcher)?;
            return Ok(vec![watcher]);
        }

        let mut armed = Vec::with_capacity(wait.fds().len());
        for (index, &fd) in wait.fds().iter().enumerate() {
            let mut watcher =
                Watcher::new(target(Some(fd))).with_read_callback(Arc::clone(&read_cb));
            let timeout_ms = if index == 0 {
                watcher = watcher.with_timeout_callback(Arc::clone(&timeout_cb));
                wait.timeout_ms()
            } else {
                TIMEOUT_FOREVER
            };
            if let Err(err) = event_loop.schedule_read(fd, timeout_ms, &mut watcher) {
                clear_all(Some(event_loop), armed);
                return Err(err);
            }
            armed.push(watcher);
        }
        Ok(armed)
    }
}

impl Default for QueryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("QueryScheduler")
            .field("attached", &state.event_loop.is_some())
            .field("pending", &state.ops.len())
            .field("closed", &state.closed)
            .finish()
    }
}
