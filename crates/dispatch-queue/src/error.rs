use dispatch_core::{TaskError, TaskId, ValidationError};
use dispatch_persistence::PersistenceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Enqueue rejected; the task never entered the queue
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The backing store could not be reached or returned an error
    #[error("Queue backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

impl QueueError {
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }
}

impl From<TaskError> for QueueError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(e) => QueueError::Validation(e),
            other => QueueError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<PersistenceError> for QueueError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::TaskError(e) => e.into(),
            PersistenceError::TaskNotFound(task_id) => QueueError::TaskNotFound(task_id),
            other => QueueError::BackendUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
