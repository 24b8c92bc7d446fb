use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The worker lost its lease, was asked to stop, or cannot run its
    /// function. Always ends the worker with the shutdown exit code.
    #[error("{0}")]
    ShuttingDown(String),

    /// No task with the given ID exists in this environment.
    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    /// The registry has no function under this key.
    #[error("Unknown task function: {key}")]
    UnknownFunction { key: String },

    /// Task intervals must be strictly positive.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// A worker process could not be started.
    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn shutting_down(reason: impl Into<String>) -> Self {
        SchedulerError::ShuttingDown(reason.into())
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, SchedulerError::ShuttingDown(_))
    }

    /// Shutdown reason carried by a task function's error, if the error
    /// (or anything in its cause chain) is a `ShuttingDown`.
    pub fn shutdown_reason(err: &anyhow::Error) -> Option<&str> {
        err.chain().find_map(|cause| match cause.downcast_ref::<SchedulerError>() {
            Some(SchedulerError::ShuttingDown(reason)) => Some(reason.as_str()),
            _ => None,
        })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A task function panicked. Carries where it panicked and the stack at
/// that point, both taken by the panic hook before unwinding.
#[derive(Debug)]
pub struct TaskPanic {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Backtrace,
}

impl fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

impl std::error::Error for TaskPanic {}
