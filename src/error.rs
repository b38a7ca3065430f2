use thiserror::Error;

use crate::store::JobStatus;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No jobs available")]
    NoJobsAvailable,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Job {job_id} is {status}, expected processing")]
    InvalidTransition { job_id: i64, status: JobStatus },

    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("{message}")]
    Execution {
        message: String,
        status_code: Option<i32>,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Worker pool has already been started")]
    AlreadyStarted,

    #[error("Invalid job list: {0}")]
    JobList(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    pub fn execution(message: impl Into<String>) -> Self {
        PoolError::Execution {
            message: message.into(),
            status_code: None,
        }
    }

    /// Store failures a lane may retry. Everything else is final for the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Store(_))
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PoolError {
    fn from(e: tokio::task::JoinError) -> Self {
        PoolError::Store(format!("background task failed: {}", e))
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::JobList(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
