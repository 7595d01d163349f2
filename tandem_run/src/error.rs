//! Error types for the bridge.
//!
//! Errors fall into four groups:
//!
//! - **Usage**: starting a second bridge, or bridging a structured future with
//!   no bridge running. Reported straight to the caller.
//! - **Cancellation**: [`Error::Cancelled`] unwinds a task or scope and is
//!   swallowed wherever it is expected.
//! - **Callback faults**: a legacy callback failed; the bridge run ends.
//! - **Bridged failures**: a [`Failure`] that crossed from one runtime to the
//!   other, carried through unchanged.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A bridge is already registered with this manager.
    #[error("a bridge is already running in this process")]
    AlreadyRunning,

    /// The operation needs a running bridge and there is none.
    #[error("no bridge is running")]
    NotRunning,

    /// The task or scope was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A callback registered by legacy code returned a failure.
    #[error("legacy callback failed: {0}")]
    CallbackFault(Failure),

    /// A task owned by a scope panicked.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// Waiting on a descriptor failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The completion value the bridge was driven against failed.
    #[error("completion value failed: {0}")]
    Legacy(Failure),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for errors caused by calling the bridge incorrectly.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::NotRunning)
    }

    /// Returns `true` for the cancellation signal.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The failure value carried by legacy deferreds.
///
/// Cheap to clone so one failure can be handed to every continuation. The
/// wrapped error can be recovered with [`Failure::downcast_ref`].
#[derive(Clone)]
pub struct Failure(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Failure {
    /// Wraps an error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Builds a failure from a plain message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(Message(message.to_string()))
    }

    /// Returns the wrapped error if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if this failure wraps [`Error::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.downcast_ref::<Error>().is_some_and(Error::is_cancelled)
    }

    /// Returns `true` if both values share the same underlying error.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.0).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
