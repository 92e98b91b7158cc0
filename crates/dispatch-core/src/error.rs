use crate::TaskType;
use thiserror::Error;

/// Rejection of an enqueue request. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid payload for {task_type}: {reason}")]
    InvalidPayload { task_type: TaskType, reason: String },
}

impl ValidationError {
    pub(crate) fn payload(task_type: TaskType, reason: impl Into<String>) -> Self {
        ValidationError::InvalidPayload {
            task_type,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task in invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, TaskError>;
