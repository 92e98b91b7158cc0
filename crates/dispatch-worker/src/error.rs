use dispatch_core::{ErrorClass, ErrorKind, TaskFailure, ValidationError};
use dispatch_llm::OrchestrationError;
use thiserror::Error;

/// Classified handler failure, ready for the queue's retry path
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled at checkpoint")
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn into_failure(self) -> TaskFailure {
        TaskFailure::new(self.kind, self.message)
    }
}

impl From<ValidationError> for HandlerError {
    fn from(e: ValidationError) -> Self {
        HandlerError::validation(e.to_string())
    }
}

impl From<OrchestrationError> for HandlerError {
    fn from(e: OrchestrationError) -> Self {
        HandlerError::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::TaskType;

    #[test]
    fn test_orchestration_errors_keep_classification() {
        let err: HandlerError = OrchestrationError::NoCandidates(TaskType::MlTraining).into();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.class(), ErrorClass::Transient);

        let err: HandlerError = OrchestrationError::Exhausted {
            task_type: TaskType::MlTraining,
            attempts: Vec::new(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_into_failure() {
        let failure = HandlerError::validation("missing prompt").into_failure();
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert_eq!(failure.message, "missing prompt");
    }
}
