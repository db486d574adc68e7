//! Worker error types.

use std::time::Duration;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Worker pool broken: {0}")]
    PoolBroken(String),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] crate::analyzer::AnalyzerError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] tonal_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] tonal_queue::QueueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classes the processing loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A single task failed; the loop moves on
    Task,
    /// The worker pool cannot accept work until it is rebuilt
    PoolBroken,
    /// Store or queue trouble; counted toward forced recovery
    Infrastructure,
    /// Anything else
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Task => "task",
            ErrorKind::PoolBroken => "pool_broken",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Other => "other",
        }
    }
}

impl WorkerError {
    pub fn task_failed(msg: impl Into<String>) -> Self {
        Self::TaskFailed(msg.into())
    }

    pub fn pool_broken(msg: impl Into<String>) -> Self {
        Self::PoolBroken(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::TaskFailed(_) | WorkerError::TaskTimeout(_) | WorkerError::Analyzer(_) => {
                ErrorKind::Task
            }
            WorkerError::PoolBroken(_) => ErrorKind::PoolBroken,
            WorkerError::Store(_) | WorkerError::Queue(_) => ErrorKind::Infrastructure,
            WorkerError::ConfigError(_) | WorkerError::Json(_) | WorkerError::Io(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Check if this error requires rebuilding the worker pool.
    pub fn is_pool_broken(&self) -> bool {
        self.kind() == ErrorKind::PoolBroken
    }
}
