//! Error types for the task engine.

use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

use crate::models::task::{TaskId, TaskType};

/// Boxed error kept as the chained cause of a retry exhaustion.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure of a single task.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The wrapped work returned an error. The same error is recorded on the task.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    #[error("task {0} has already been run")]
    AlreadyRun(TaskId),
}

impl TaskError {
    /// The underlying error raised by the work, if any.
    pub fn cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            TaskError::Failed(err) => Some(err),
            TaskError::AlreadyRun(_) => None,
        }
    }
}

/// Outcome of waiting on a queue that did not yield a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DequeueError {
    /// Nothing arrived within the wait. Callers poll again.
    #[error("no task of type '{0}' arrived in time")]
    Timeout(TaskType),

    #[error("queue for type '{0}' is disconnected")]
    Disconnected(TaskType),
}

impl DequeueError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DequeueError::Timeout(_))
    }
}

/// Reason a worker loop terminated abnormally.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker '{worker}' stopped after task {task} failed: {source}")]
    TaskFailed {
        worker: String,
        task: TaskId,
        #[source]
        source: TaskError,
    },

    #[error("worker '{worker}' lost its queue: {source}")]
    Dispatch {
        worker: String,
        #[source]
        source: DequeueError,
    },

    #[error("worker '{0}' thread panicked")]
    Panicked(String),
}

/// Errors reported by the task manager itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("shutdown requested, task {0} rejected")]
    ShuttingDown(TaskId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("queue for type '{0}' is closed")]
    QueueClosed(TaskType),

    #[error("failed to spawn worker thread '{0}'")]
    SpawnFailed(String),
}

/// Retry exhaustion. The variant tells what the final attempt did.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("retry exhausted: max_attempts is 0, operation never invoked")]
    NoAttempts,

    #[error("retry exhausted after {attempts} attempts: {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("retry exhausted after {attempts} attempts: got {actual:?}, expected {expected:?}")]
    Mismatch {
        attempts: u32,
        actual: String,
        expected: String,
    },
}

impl RetryError {
    /// Number of times the operation was invoked before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NoAttempts => 0,
            RetryError::Cancelled { attempts }
            | RetryError::Failed { attempts, .. }
            | RetryError::Mismatch { attempts, .. } => *attempts,
        }
    }
}
