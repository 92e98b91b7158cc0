//! Failure classification and the retry policy shared by the provider adapter
//! and the queue's task-level retry path.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What went wrong, as recorded on the task and in dead letter entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, DNS failure, truncated body
    Network,
    /// HTTP 429 or provider-side quota
    RateLimited,
    /// HTTP 5xx or every candidate provider exhausted transiently
    ProviderUnavailable,
    /// Handler exceeded its per-type budget
    Timeout,
    /// Worker shut down while holding the claim
    WorkerShutdown,
    /// Claim lease ran out before the worker reported back
    LeaseExpired,
    /// Handler panicked
    Panicked,
    /// Unexpected internal failure
    Internal,
    /// Payload rejected by the handler
    Validation,
    /// Credentials rejected (401/403)
    Auth,
    /// Provider refused the request (4xx other than 429)
    ProviderRejected,
    /// No handler registered for the task type
    NoHandler,
    /// Task was cancelled while running
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WorkerShutdown => "worker_shutdown",
            ErrorKind::LeaseExpired => "lease_expired",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Internal => "internal",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::ProviderRejected => "provider_rejected",
            ErrorKind::NoHandler => "no_handler",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Network
            | ErrorKind::RateLimited
            | ErrorKind::ProviderUnavailable
            | ErrorKind::WorkerShutdown
            | ErrorKind::LeaseExpired
            | ErrorKind::Panicked
            | ErrorKind::Internal => ErrorClass::Transient,
            ErrorKind::Timeout => ErrorClass::Timeout,
            ErrorKind::Validation
            | ErrorKind::Auth
            | ErrorKind::ProviderRejected
            | ErrorKind::NoHandler
            | ErrorKind::Cancelled => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Timeout,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Exponential backoff parameterized by error class.
///
/// `max_retries` bounds the number of failed attempts: the failure that brings
/// the count to `max_retries` gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    /// Fraction of the delay randomized in either direction, 0.0 to 1.0
    pub jitter: f64,
    pub retry_timeouts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 3_600_000,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            jitter: 0.2,
            retry_timeouts: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// `base × 2^n`, capped at `max_delay_ms`
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u64.checked_pow(n).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Decide what to do after the `failures`-th failed attempt
    pub fn decide(&self, class: ErrorClass, failures: u32) -> RetryDecision {
        let retryable = match class {
            ErrorClass::Fatal => false,
            ErrorClass::Timeout => self.retry_timeouts,
            ErrorClass::Transient => true,
        };

        if retryable && failures < self.max_retries {
            RetryDecision::Retry {
                delay: self.delay_for(failures),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Spread `delay` by up to `jitter` in either direction
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}
