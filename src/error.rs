use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchdError {
    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BatchdError>;
