//! dnsloop: pluggable event-loop contract and query scheduling core for DNS resolution.
//!
//! # Overview
//!
//! A resolver never owns a reactor. The embedding application supplies one, and
//! the resolver talks to it through a small capability set: arm a readiness
//! watch on a descriptor, arm a deadline, clear either, release the binding.
//! Everything the resolver does asynchronously (send a query, wait for the
//! answer or give up after N milliseconds, retransmit) is expressed as
//! operations that the [`QueryScheduler`] parks on those watches.
//!
//! # Core Guarantees
//!
//! - **No leaked registrations**: every watcher armed for an operation is
//!   cleared before the operation resumes, is cancelled, or completes
//! - **All-or-nothing arming**: a failed registration leaves nothing armed
//! - **Drain before detach**: a binding is cleaned up only after every
//!   operation using it has been cancelled and its watchers cleared
//! - **No lock held across callbacks**: watchers may be cleared from inside a
//!   firing callback
//!
//! # Module Structure
//!
//! - [`eventloop`]: the [`EventLoop`] contract and the [`Watcher`] record
//! - [`reactor`]: the external reactor interface and the deterministic [`LabReactor`]
//! - [`binding`]: the reference [`ReactorBinding`] and [`attach_reactor`]
//! - [`scheduler`]: pending operations, arming, completion dispatch
//! - [`context`]: the resolution [`Context`] owning the attached event loop
//! - [`query`]: built-in operations ([`Delay`], `DatagramQuery`)
//! - [`config`]: [`LoopConfig`] with environment and TOML overrides
//! - [`error`]: error types
//! - [`types`]: virtual time and identifiers
//!
//! # Example
//!
//! ```ignore
//! use dnsloop::{attach_reactor, Context, Delay, LabReactor};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ctx = Context::new();
//! let reactor = Arc::new(LabReactor::new());
//! attach_reactor(Some(&ctx), Some(reactor.clone()))?;
//!
//! ctx.submit(Delay::new(50), |id, result| {
//!     println!("{id} finished: {result:?}");
//! })?;
//!
//! reactor.run_for(Duration::from_millis(50));
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod eventloop;
pub mod query;
pub mod reactor;
pub mod scheduler;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use binding::{attach_reactor, ReactorBinding};
pub use config::{ConfigError, LoopConfig, QueryConfig};
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use eventloop::{
    Descriptor, EventCallback, EventLoop, ReactorHandle, UserArg, Watcher, WatcherState,
    INVALID_DESCRIPTOR, TIMEOUT_FOREVER,
};
pub use query::Delay;
#[cfg(unix)]
pub use query::{DatagramQuery, DatagramResponse};
pub use reactor::{Interest, LabReactor, Reactor, Token, WatchCallback, WatchId};
pub use scheduler::{Operation, QueryScheduler, Step, Wait};
pub use types::{OperationId, Time};
