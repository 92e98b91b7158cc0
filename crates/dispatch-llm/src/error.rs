use crate::ProviderId;
use dispatch_core::{ErrorClass, ErrorKind, TaskType};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single provider call, already classified
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Timeout, 429, 5xx, broken connection
    #[error("{provider} transient failure ({kind}): {message}")]
    Transient {
        provider: ProviderId,
        kind: ErrorKind,
        message: String,
        /// Server-provided wait from a `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// Auth or validation rejection (4xx other than 429)
    #[error("{provider} rejected request ({kind}): {message}")]
    Fatal {
        provider: ProviderId,
        kind: ErrorKind,
        message: String,
    },
}

impl ProviderError {
    pub fn transient(provider: ProviderId, kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            provider,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(provider: ProviderId, kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError::Fatal {
            provider,
            kind,
            message: message.into(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderError::Transient { provider, .. } | ProviderError::Fatal { provider, .. } => *provider,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transient { kind, .. } | ProviderError::Fatal { kind, .. } => *kind,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Transient { retry_after, .. } => *retry_after,
            ProviderError::Fatal { .. } => None,
        }
    }
}

/// One candidate the orchestrator could not use
#[derive(Debug, Clone, PartialEq)]
pub enum FailedAttempt {
    Failed {
        model: String,
        error: ProviderError,
    },
    /// Circuit open; not called
    Skipped { provider: ProviderId, model: String },
    /// No client configured for the provider
    Unconfigured { provider: ProviderId, model: String },
}

impl FailedAttempt {
    fn is_transient(&self) -> bool {
        match self {
            FailedAttempt::Failed { error, .. } => error.is_transient(),
            FailedAttempt::Skipped { .. } => true,
            FailedAttempt::Unconfigured { .. } => false,
        }
    }
}

impl fmt::Display for FailedAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedAttempt::Failed { model, error } => write!(f, "{}: {}", model, error),
            FailedAttempt::Skipped { provider, model } => write!(f, "{}/{}: circuit open", provider, model),
            FailedAttempt::Unconfigured { provider, model } => write!(f, "{}/{}: no client", provider, model),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("No candidates configured for task type {0}")]
    NoCandidates(TaskType),

    #[error("All {} candidates for {task_type} failed: {}", attempts.len(), join(attempts))]
    Exhausted {
        task_type: TaskType,
        attempts: Vec<FailedAttempt>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestrationError {
    /// Classification for the task-level retry path. Exhaustion is transient
    /// when any candidate failed transiently or was skipped by its breaker.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::Exhausted { attempts, .. } => {
                if attempts.iter().any(FailedAttempt::is_transient) {
                    ErrorKind::ProviderUnavailable
                } else if attempts.iter().any(|a| {
                    matches!(a, FailedAttempt::Failed { error, .. } if error.kind() == ErrorKind::Auth)
                }) {
                    ErrorKind::Auth
                } else {
                    ErrorKind::ProviderRejected
                }
            }
            OrchestrationError::NoCandidates(_) | OrchestrationError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }
}

fn join(attempts: &[FailedAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Routing configuration that failed its startup consistency check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid routing configuration: {}", issues.join("; "))]
pub struct ConfigError {
    pub issues: Vec<String>,
}
