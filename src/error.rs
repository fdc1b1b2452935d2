//! Error types shared by the hub, tasks and synchronization primitives.
//!
//! Every blocking operation reports failure through [`Error`]. Task outcomes
//! that are not produced by the task itself (a kill, a panic) are reported
//! through [`TaskError`]. The dependency-graph pool has its own generic
//! error, see [`crate::sync::dagpool`].

use crate::hub::Direction;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the hub and the blocking primitives.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The awaited condition did not happen before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The file descriptor was closed while a task was waiting on it.
    #[error("file descriptor {0} was closed while a task was waiting on it")]
    Closed(RawFd),

    /// A non-blocking put found no free slot.
    #[error("queue is full")]
    Full,

    /// A non-blocking get found no item.
    #[error("queue is empty")]
    Empty,

    /// `send` or `send_exception` called on an event that already holds a value.
    #[error("event has already been sent")]
    AlreadySent,

    /// `reset` called on an event that was never sent.
    #[error("event has not been sent, there is nothing to reset")]
    NotSent,

    /// A bounded semaphore was released more times than it was acquired.
    #[error("semaphore released too many times")]
    ReleasedTooManyTimes,

    /// `Queue::task_done` called more times than items were put.
    #[error("task_done() called too many times")]
    TaskDoneTooManyTimes,

    /// A suspending call was made from a hub callback instead of a task.
    #[error("cannot suspend from the hub's own context, this would deadlock")]
    BlockingInHub,

    /// A second listener was registered for the same fd and direction.
    #[error("second simultaneous {direction} listener on fd {fd}")]
    DuplicateListener { fd: RawFd, direction: Direction },

    /// `Pool::waitall` called by a task the pool itself is running.
    #[error("waitall() called from one of the pool's own tasks would never return")]
    WaitallFromMember,

    /// The hub is already running its loop.
    #[error("hub is already running")]
    AlreadyRunning,

    /// An OS call made by the hub failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The hub configuration could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Errors raised while reading or applying a hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown hub backend {0:?}")]
    UnknownBackend(String),

    #[error("hub backend {0:?} is not available on this platform")]
    UnsupportedBackend(String),

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Outcomes of a task that did not come from its own return value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was killed before it finished.
    #[error("task was killed")]
    Killed,

    /// The task panicked; the payload message is kept.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Builds a [`TaskError::Panicked`] from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };

        TaskError::Panicked(message)
    }
}
