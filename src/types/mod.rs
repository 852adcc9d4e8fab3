//! Core types shared by the reactor, the binding and the scheduler.
//!
//! - [`id`]: virtual [`Time`] and [`OperationId`]

pub mod id;

pub use id::{OperationId, Time};
