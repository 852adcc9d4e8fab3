//! Error types for the event-loop contract and the query scheduler.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Errors are returned, never thrown, and are local to the failing call
//! - A failed registration never leaves partial reactor state behind
//!
//! # Error Kinds
//!
//! | Kind | Raised by |
//! |------|-----------|
//! | `BadContext` | attachment or submission against an absent or shut-down context |
//! | `InvalidParameter` | malformed registration or wait request |
//! | `MemoryError` | watcher state could not be allocated |
//! | `ContractViolation` | caller broke the contract (clearing an unarmed watcher) |
//! | `Reactor` | the external reactor refused to start or stop a watch |
//! | `TimedOut` | an operation gave up after its deadline |
//! | `Cancelled` | an operation was cancelled or its event loop detached |
//! | `Io` | socket I/O performed by a built-in operation failed |
//! | `Config` | configuration could not be loaded |

use core::fmt;
use std::io;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The context handle is absent or no longer usable.
    BadContext,
    /// A registration or wait request was malformed.
    InvalidParameter,
    /// Watcher state could not be allocated.
    MemoryError,
    /// The caller violated the event-loop contract.
    ContractViolation,
    /// The external reactor refused a start or stop request.
    Reactor,
    /// The operation's deadline elapsed.
    TimedOut,
    /// The operation was cancelled.
    Cancelled,
    /// Socket I/O failed.
    Io,
    /// Configuration could not be loaded.
    Config,
}

impl ErrorKind {
    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::MemoryError | Self::TimedOut | Self::Io)
    }
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Creates a bad-context error.
    #[must_use]
    pub fn bad_context(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadContext).with_message(detail)
    }

    /// Creates an invalid-parameter error.
    #[must_use]
    pub fn invalid_parameter(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter).with_message(detail)
    }

    /// Creates an allocation failure error.
    #[must_use]
    pub fn memory(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::MemoryError).with_message(detail)
    }

    /// Creates a contract violation error.
    #[must_use]
    pub fn contract_violation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContractViolation).with_message(detail)
    }

    /// Creates a timeout error after `attempts` tries.
    #[must_use]
    pub fn timed_out(attempts: u32) -> Self {
        Self::new(ErrorKind::TimedOut).with_message(format!("no answer after {attempts} attempts"))
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(detail)
    }

    /// Wraps an I/O error reported by the external reactor.
    ///
    /// `OutOfMemory` becomes [`ErrorKind::MemoryError`] so that callers see the
    /// same taxonomy whether the binding or the reactor ran out of space.
    #[must_use]
    pub fn from_reactor(err: io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::OutOfMemory {
            ErrorKind::MemoryError
        } else {
            ErrorKind::Reactor
        };
        Self::new(kind)
            .with_message(format!("reactor refused watch: {err}"))
            .with_source(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::Io)
            .with_message(err.to_string())
            .with_source(err)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

/// A specialized Result type for dnsloop operations.
pub type Result<T> = core::result::Result<T, Error>;
