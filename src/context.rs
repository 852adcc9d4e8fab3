//! Resolution context.
//!
//! A [`Context`] is what the embedding application holds. It carries the
//! loop configuration and a [`QueryScheduler`], and it is the target of the
//! attachment API: [`attach_reactor`](crate::attach_reactor) for the
//! reference binding, [`Context::attach_event_loop`] for any other.
//!
//! ```ignore
//! let context = Context::new();
//! attach_reactor(Some(&context), Some(reactor))?;
//! let id = context.submit(Delay::new(250), |id, result| {
//!     println!("{id} finished: {result:?}");
//! })?;
//! ```
//!
//! Clones share the same scheduler.

use crate::config::LoopConfig;
use crate::error::Result;
use crate::eventloop::EventLoop;
use crate::scheduler::{Operation, QueryScheduler};
use crate::tracing_compat::{debug, info};
use crate::types::OperationId;
use std::sync::Arc;

/// Handle to one resolution context.
#[derive(Clone, Debug)]
pub struct Context {
    scheduler: QueryScheduler,
    config: Arc<LoopConfig>,
}

impl Context {
    /// Creates a context with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a context with `config`.
    #[must_use]
    pub fn with_config(config: LoopConfig) -> Self {
        debug!(max_watchers = config.max_watchers, "context created");
        Self {
            scheduler: QueryScheduler::new(),
            config: Arc::new(config),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &QueryScheduler {
        &self.scheduler
    }

    /// Installs `event_loop`, detaching any previous one first.
    ///
    /// The previous loop's pending operations complete with `Cancelled` and
    /// its [`cleanup`](EventLoop::cleanup) runs before the new loop is
    /// installed.
    ///
    /// # Errors
    ///
    /// `BadContext` if the context was shut down. If cleaning up the previous
    /// loop fails, that error is returned and no loop is attached.
    pub fn attach_event_loop(&self, event_loop: Box<dyn EventLoop>) -> Result<()> {
        self.scheduler.attach(event_loop)
    }

    /// Detaches the current event loop, cancelling pending operations.
    ///
    /// # Errors
    ///
    /// Whatever the loop's cleanup reported. The context is detached either
    /// way.
    pub fn detach_event_loop(&self) -> Result<()> {
        self.scheduler.detach()
    }

    /// Returns `true` if an event loop is attached.
    #[must_use]
    pub fn has_event_loop(&self) -> bool {
        self.scheduler.is_attached()
    }

    /// Submits an operation; see [`QueryScheduler::submit`].
    ///
    /// # Errors
    ///
    /// `BadContext` without an attached event loop or after shutdown.
    pub fn submit<O, F>(&self, op: O, on_complete: F) -> Result<OperationId>
    where
        O: Operation,
        F: FnOnce(OperationId, Result<O::Output>) + Send + 'static,
    {
        self.scheduler.submit(op, on_complete)
    }

    /// Cancels a pending operation; see [`QueryScheduler::cancel`].
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `id` is not pending.
    pub fn cancel(&self, id: OperationId) -> Result<()> {
        self.scheduler.cancel(id)
    }

    /// Number of operations still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Number of watchers armed through the attached loop.
    #[must_use]
    pub fn armed_watchers(&self) -> usize {
        self.scheduler.armed_watchers()
    }

    /// Detaches the event loop and refuses any further use.
    ///
    /// # Errors
    ///
    /// Whatever the loop's cleanup reported.
    pub fn shutdown(&self) -> Result<()> {
        info!(pending = self.pending_count(), "context shutting down");
        self.scheduler.close()
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.scheduler.is_closed()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
