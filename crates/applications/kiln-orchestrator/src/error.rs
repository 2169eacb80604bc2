//! Error types for the orchestrator

use kiln_core::{JobId, KilnError};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Request failed validation; nothing was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Regular plus bonus tokens do not cover the cost
    #[error("Insufficient balance: need {required} tokens, have {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Guest session used up its free generations
    #[error("Guest generation limit reached ({max})")]
    GuestLimitReached { max: u32 },

    /// Guests may only create some job kinds
    #[error("Guests cannot create {0} jobs")]
    GuestKindNotAllowed(String),

    /// Immediate submission failed; the reservation was returned
    #[error("Failed to submit job {job_id} for processing (refunded: {refunded})")]
    SubmissionFailed { job_id: JobId, refunded: bool },

    /// Job, user or instance not found (or not visible to the caller)
    #[error("{0} not found")]
    NotFound(String),

    /// Job is in a state that cannot be cancelled
    #[error("Job cannot be cancelled: {0}")]
    NotCancellable(String),

    /// Webhook signature did not verify
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Webhook or provider payload could not be understood
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Provider, store or storage error
    #[error(transparent)]
    Core(#[from] KilnError),

    /// Remote API answered with an unexpected status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a not-cancellable error
    pub fn not_cancellable(msg: impl Into<String>) -> Self {
        Self::NotCancellable(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an API error from a non-success response status
    pub fn api(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        Self::Api {
            status: status.as_u16(),
            message: message.into(),
        }
    }
}

/// Lets provider and market clients use `?` on orchestrator errors inside
/// trait methods that return core results.
impl From<OrchestratorError> for KilnError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Core(e) => e,
            OrchestratorError::Timeout(d) => KilnError::Timeout(format!("{:?}", d)),
            OrchestratorError::Http(e) if e.is_timeout() => KilnError::Timeout(e.to_string()),
            OrchestratorError::Http(e) => KilnError::Network(e.to_string()),
            OrchestratorError::Api { status: 401 | 403, message } => KilnError::Auth(message),
            OrchestratorError::Api { status: 404, message } => KilnError::NotFound(message),
            OrchestratorError::Api { status, message } if status >= 500 => {
                KilnError::Network(format!("upstream {}: {}", status, message))
            }
            OrchestratorError::Json(e) => KilnError::InvalidResponse(e.to_string()),
            OrchestratorError::InvalidPayload(msg) => KilnError::InvalidResponse(msg),
            OrchestratorError::Database(e) => KilnError::Database(e.to_string()),
            other => KilnError::Provider(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_errors_map_to_core_kinds() {
        let auth: KilnError = OrchestratorError::Api {
            status: 401,
            message: "expired".into(),
        }
        .into();
        assert!(matches!(auth, KilnError::Auth(_)));

        let upstream: KilnError = OrchestratorError::Api {
            status: 503,
            message: "busy".into(),
        }
        .into();
        assert!(upstream.is_transient());

        let core: KilnError = OrchestratorError::Core(KilnError::storage("disk full")).into();
        assert!(matches!(core, KilnError::Storage(_)));
    }
}
