//! Unified error types for the mailer platform
//!
//! Standardizes error handling across the intake, outbox, and worker
//! surfaces so logging, HTTP responses, and retry decisions all agree
//! on what a given failure means.
//!
//! # Design Principles
//!
//! 1. **Type Safety**: Strongly typed errors prevent runtime surprises
//! 2. **Context Preservation**: Errors carry context for debugging
//! 3. **No PII**: Email addresses and CSV content never appear in an error message
//! 4. **HTTP Integration**: Maps cleanly to the thin intake/status HTTP surface
//! 5. **Observability**: Structured logging with tracing

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod database;
pub mod validation;
pub mod auth;
pub mod http;

pub use database::DatabaseError;
pub use validation::ValidationError;
pub use auth::AuthError;

/// Core error type used across the mailer platform.
///
/// Variants map onto the taxonomy of the dispatch pipeline: validation
/// failures at the row level, transient vs. permanent provider failures,
/// auth failures distinct from provider auth, storage failures, broker
/// failures, and the DB-conflict "not an error" signal used by the
/// worker's compare-and-set lock.
///
/// # Example
/// ```rust
/// use error_types::MailerError;
///
/// fn load_mailing(id: uuid::Uuid) -> Result<(), MailerError> {
///     Err(MailerError::NotFound {
///         resource: "mailing",
///         id: id.to_string(),
///     })
/// }
/// ```
#[derive(Debug, Error)]
pub enum MailerError {
    /// Resource not found
    #[error("Resource not found: {resource}")]
    NotFound {
        resource: &'static str,
        id: String,
    },

    /// Invalid input provided (malformed upload, bad row, etc.)
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Duplicate filename at intake
    #[error("A mailing with this filename already exists")]
    DuplicateJob { filename: String },

    /// Email address failed syntax/disposable/MX validation
    #[error("Validation failed")]
    Validation {
        #[from]
        source: ValidationError,
    },

    /// 408/429/5xx/network from the email provider — retryable
    #[error("Transient provider failure: {detail}")]
    TransientProviderFailure { status: Option<u16>, detail: String },

    /// 400/403/404/422 from the email provider — not retryable
    #[error("Permanent provider failure: {detail}")]
    PermanentProviderFailure { status: u16, detail: String },

    /// Provider 401, distinct from the auth endpoint itself failing
    #[error("Provider authentication failure")]
    AuthFailure {
        #[source]
        source: Option<AuthError>,
    },

    /// CSV storage read/write failure
    #[error("Storage operation failed: {detail}")]
    StorageFailure { detail: String },

    /// Broker publish/confirm/connect failure
    #[error("Broker operation failed: {detail}")]
    BrokerFailure { detail: String },

    /// Database operation failed
    #[error("Database error")]
    Database {
        #[from]
        source: DatabaseError,
    },

    /// Compare-and-set lock was not acquired. Not an error condition in
    /// the usual sense — it is the idempotency signal that another
    /// worker already owns (or has finished) this job.
    #[error("Lock not acquired (job owned elsewhere or already terminal)")]
    LockNotAcquired,

    /// Rate limiter accessed before `RateLimiter::init`,
    /// or Token Manager accessed before initialization.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Conflict (e.g., duplicate resource)
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Circuit breaker open for a downstream dependency
    #[error("Service temporarily unavailable")]
    CircuitBreakerOpen { service: String },

    /// Process is draining during graceful shutdown; new work is rejected
    #[error("Service is shutting down")]
    ServiceUnavailable,

    /// Internal server error (catch-all)
    #[error("Internal server error")]
    Internal {
        #[source]
        source: anyhow::Error,
    },
}

impl MailerError {
    /// Log at the level appropriate to the error's severity/origin.
    pub fn log(&self) {
        match self {
            Self::NotFound { .. } | Self::InvalidInput { .. } | Self::DuplicateJob { .. } => {
                tracing::debug!(error = ?self, "client error");
            }
            Self::Validation { .. } => {
                tracing::debug!(error = ?self, "validation failure");
            }
            Self::LockNotAcquired => {
                tracing::debug!("lock not acquired, another worker owns this job");
            }
            Self::TransientProviderFailure { .. } | Self::CircuitBreakerOpen { .. } => {
                tracing::warn!(error = ?self, "transient dependency failure");
            }
            Self::ServiceUnavailable => {
                tracing::debug!("rejecting new work, service is shutting down");
            }
            Self::PermanentProviderFailure { .. } | Self::AuthFailure { .. } => {
                tracing::warn!(error = ?self, "permanent dependency failure");
            }
            Self::StorageFailure { .. } | Self::BrokerFailure { .. } => {
                tracing::error!(error = ?self, "infrastructure failure");
            }
            Self::Database { .. } | Self::Internal { .. } => {
                tracing::error!(error = ?self, "server error");
            }
            Self::Conflict { .. } | Self::Timeout { .. } | Self::Precondition(_) => {
                tracing::warn!(error = ?self, "service error");
            }
        }
    }

    pub fn internal<E: Into<anyhow::Error>>(error: E) -> Self {
        Self::Internal { source: error.into() }
    }

    /// HTTP status code for the thin intake/status surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::InvalidInput { .. } | Self::Validation { .. } => 400,
            Self::DuplicateJob { .. } | Self::Conflict { .. } => 409,
            Self::AuthFailure { .. } => 401,
            Self::LockNotAcquired => 409,
            Self::Precondition(_) => 412,
            Self::TransientProviderFailure { .. } | Self::BrokerFailure { .. } => 503,
            Self::PermanentProviderFailure { .. } => 502,
            Self::StorageFailure { .. } | Self::Database { .. } | Self::Internal { .. } => 500,
            Self::Timeout { .. } => 504,
            Self::CircuitBreakerOpen { .. } => 503,
            Self::ServiceUnavailable => 503,
        }
    }
}

/// Result type alias for mailer operations
pub type MailerResult<T> = Result<T, MailerError>;

/// Error context extension trait for adding context to Results
pub trait ErrorContext<T> {
    fn context<C>(self, context: C) -> MailerResult<T>
    where
        C: fmt::Display + Send + Sync + 'static;

    fn with_context<C, F>(self, f: F) -> MailerResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> MailerResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|e| MailerError::internal(anyhow::anyhow!("{}: {}", context, e)))
    }

    fn with_context<C, F>(self, f: F) -> MailerResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| MailerError::internal(anyhow::anyhow!("{}: {}", f(), e)))
    }
}

/// Attach a mailing id to an Internal error for log correlation, without
/// leaking it into the Display text used for client-facing responses.
pub fn tag_mailing(err: anyhow::Error, mailing_id: Uuid) -> MailerError {
    tracing::error!(mailing_id = %mailing_id, error = %err, "mailing operation failed");
    MailerError::internal(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code() {
        let error = MailerError::NotFound { resource: "mailing", id: "123".to_string() };
        assert_eq!(error.status_code(), 404);
    }

    #[test]
    fn test_no_pii_in_error_messages() {
        let error = MailerError::InvalidInput {
            message: "row rejected".to_string(),
            source: None,
        };
        let message = error.to_string();
        assert!(!message.contains('@'));
        assert_eq!(message, "Invalid input: row rejected");
    }

    #[test]
    fn test_error_context() {
        fn failing_operation() -> Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
        }

        let result: MailerResult<()> = failing_operation().context("loading CSV");
        assert!(result.is_err());
        matches!(result.unwrap_err(), MailerError::Internal { .. });
    }

    #[test]
    fn test_lock_not_acquired_is_409() {
        assert_eq!(MailerError::LockNotAcquired.status_code(), 409);
    }
}
