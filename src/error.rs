//! Error types for the experiment master.

use std::fmt;

use crate::scheduler::Rid;

/// Top-level error type for the master.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Label for a worker that may not have been assigned a RID yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RidLabel(pub Option<Rid>);

impl fmt::Display for RidLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(rid) => write!(f, "{rid}"),
            None => write!(f, "<none>"),
        }
    }
}

/// Failures while talking to a worker subprocess.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// An I/O deadline (sending an action) was exceeded.
    #[error("Timeout {operation} worker (RID {rid})")]
    Timeout {
        rid: RidLabel,
        operation: &'static str,
    },

    /// A watchdog or the action's own deadline expired without a reply.
    #[error("Watchdog expired (RID {rid})")]
    WatchdogTimeout { rid: RidLabel },

    /// The experiment raised inside the subprocess; it was logged there.
    #[error("Worker raised an exception (RID {rid}): {message}")]
    InternalException { rid: RidLabel, message: String },

    /// Protocol violation: malformed reply, unexpected EOF, cancelled send.
    #[error("Worker protocol error (RID {rid}): {reason}")]
    Protocol { rid: RidLabel, reason: String },

    #[error("Failed to spawn worker (RID {rid}): {source}")]
    Spawn {
        rid: RidLabel,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    pub(crate) fn protocol(rid: Option<Rid>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            rid: RidLabel(rid),
            reason: reason.into(),
        }
    }

    /// Whether the subprocess already reported (and logged) this failure.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalException { .. })
    }
}

/// Scheduler facade errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("RID {rid} not found")]
    RunNotFound { rid: Rid },

    #[error("Scheduler is terminated, submissions are rejected")]
    Terminated,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Experiment repository errors.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Checkout of revision {rev} failed: {reason}")]
    Checkout { rev: String, reason: String },

    #[error("Revision {rev} is not checked out")]
    NotCheckedOut { rev: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors answered to a worker as a `failed` reply.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Missing argument {name} for {action}")]
    MissingArgument { action: String, name: String },

    #[error("Invalid argument {name} for {action}: {reason}")]
    InvalidArgument {
        action: String,
        name: String,
        reason: String,
    },

    #[error("Dataset {key} not found")]
    DatasetNotFound { key: String },

    #[error("Watchdog {id} not found")]
    WatchdogNotFound { id: i64 },

    #[error("Invalid watchdog timeout {timeout:?}")]
    InvalidTimeout { timeout: f64 },

    #[error("Scheduler is no longer available")]
    SchedulerGone,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Failures inside the experiment host (the worker subprocess).
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// The master asked for termination on resume.
    #[error("Termination requested")]
    TerminationRequested,

    #[error("{0}")]
    Failed(String),

    /// The master answered a request with `failed`.
    #[error("Request {action} failed: {exception}")]
    Request { action: String, exception: String },

    #[error("Unknown experiment class {0}")]
    UnknownClass(String),

    #[error("Invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Host protocol error: {0}")]
    Protocol(String),

    /// The master sent `terminate` or closed the channel.
    #[error("Master asked the worker to exit")]
    Exit,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the master.
pub type Result<T> = std::result::Result<T, Error>;
