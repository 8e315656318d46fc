//! Error types for the retention engine
//!
//! Errors are classified by recoverability:
//! - Retryable: network issues, timeouts, upstream rate limits and 5xx
//! - NonRetryable: configuration errors, rejected credentials, bad requests
//!
//! Row-level content problems never surface here; the normalizer skips them.

use thiserror::Error;

use crate::source::SourceError;

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(#[from] SourceError),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Upstream(source) => source.is_retryable(),
            EngineError::Timeout(_) => true,
            EngineError::Configuration(_) | EngineError::InvalidRequest(_) => false,
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "Check your configuration in ~/.churnwatch/config.json",
            EngineError::Upstream(SourceError::Unauthorized(_)) => {
                "The upstream provider rejected the API token. Update apiToken or CHURNWATCH_API_TOKEN."
            }
            EngineError::Upstream(_) if self.is_retryable() => {
                "The member system is unreachable or busy. Try again in a few minutes."
            }
            EngineError::Upstream(_) => "Check the source export or API response format.",
            EngineError::Timeout(_) => "The upstream fetch took too long. Try again.",
            EngineError::InvalidRequest(_) => "Check the request parameters.",
        }
    }
}

/// Serializable error payload handed to callers instead of a partial result
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub success: bool,
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
}

impl From<&EngineError> for ErrorPayload {
    fn from(err: &EngineError) -> Self {
        let error_type = if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorPayload {
            success: false,
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
