use thiserror::Error;

use crate::task::TaskId;

/// Invalid pool configuration, refused at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("core_size={core} exceeds max_size={max}")]
    CoreExceedsMax { core: usize, max: usize },

    #[error("max_size must be at least 1")]
    ZeroMaxSize,
}

/// Admission refused a submission.
///
/// Recoverable: the pool stays usable and the submitter may retry, back
/// off, or shed the work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectedError {
    #[error("pool saturated, {0} rejected")]
    Saturated(TaskId),

    #[error("pool is shut down")]
    ShutDown,

    #[error("worker spawn failed: {0}")]
    WorkerSpawn(String),
}

/// A task body failed.
///
/// Reaches the submitter only through that task's handle; it never affects
/// the pool or other tasks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Shorthand for a plain failure message.
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Outcome of waiting for a task result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("task failed: {0}")]
    Failed(TaskError),

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out waiting for the result")]
    Timeout,

    #[error("result already retrieved")]
    Retrieved,
}
