use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Errors returned by caller-facing engine operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Serializable discriminant of a failure, stored on jobs and publish outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ExternalServiceError,
    CircuitOpenError,
    RateLimitError,
    TimeoutError,
    CancelledError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ExternalServiceError => "ExternalServiceError",
            ErrorKind::CircuitOpenError => "CircuitOpenError",
            ErrorKind::RateLimitError => "RateLimitError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::CancelledError => "CancelledError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Which deadline a [`ServiceError::Timeout`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutScope {
    /// A single external call exceeded its per-call timeout.
    Call,
    /// The whole job exceeded its overall deadline.
    Job,
}

/// Failure of an external call or of a pipeline stage.
///
/// Only transient failures are retried by default: timeouts, 5xx,
/// connection resets and rate limiting. Everything else fails fast.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// The request was rejected before reaching the dependency.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The dependency answered with an error or could not be reached.
    #[error("External service error{}: {message}", fmt_status(.status))]
    ExternalService {
        message: String,
        status: Option<u16>,
        transient: bool,
    },

    /// The breaker for `dependency` rejected the call without executing it.
    #[error("Circuit breaker is open for {dependency}")]
    CircuitOpen { dependency: String },

    /// The dependency asked us to slow down.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Timed out after {}ms ({scope:?} deadline)", .after.as_millis())]
    Timeout { scope: TimeoutScope, after: Duration },

    /// Cooperative cancellation was observed.
    #[error("Cancelled")]
    Cancelled,

    /// Unclassified failure. Never retried.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl ServiceError {
    /// A retryable failure (network error, 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        ServiceError::ExternalService {
            message: message.into(),
            status: None,
            transient: true,
        }
    }

    /// A non-retryable failure (4xx, auth, malformed response).
    pub fn permanent(message: impl Into<String>) -> Self {
        ServiceError::ExternalService {
            message: message.into(),
            status: None,
            transient: false,
        }
    }

    /// Classify an HTTP status returned by a dependency.
    ///
    /// 429 becomes [`ServiceError::RateLimited`]; 408 and 5xx are transient;
    /// every other status is permanent.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => ServiceError::RateLimited {
                message,
                retry_after,
            },
            408 | 500..=599 => ServiceError::ExternalService {
                message,
                status: Some(status),
                transient: true,
            },
            _ => ServiceError::ExternalService {
                message,
                status: Some(status),
                transient: false,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::ValidationError,
            ServiceError::ExternalService { .. } => ErrorKind::ExternalServiceError,
            ServiceError::CircuitOpen { .. } => ErrorKind::CircuitOpenError,
            ServiceError::RateLimited { .. } => ErrorKind::RateLimitError,
            ServiceError::Timeout { .. } => ErrorKind::TimeoutError,
            ServiceError::Cancelled => ErrorKind::CancelledError,
            ServiceError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether the default retry predicate should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::ExternalService { transient, .. } => *transient,
            ServiceError::RateLimited { .. } => true,
            ServiceError::Timeout { scope, .. } => *scope == TimeoutScope::Call,
            _ => false,
        }
    }

    /// Whether this outcome says something bad about the dependency's health.
    ///
    /// Permanent 4xx-style failures mean the dependency answered, so they do
    /// not trip its breaker. Circuit-open rejections never reached it.
    pub fn counts_against_dependency(&self) -> bool {
        self.is_transient()
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
