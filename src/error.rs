// src/error.rs
// Standardized error types for contextd

use thiserror::Error;

/// Main error type for the contextd library
#[derive(Error, Debug)]
pub enum ContextdError {
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("embedder at capacity, try again later")]
    EmbedderBusy,

    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using ContextdError
pub type Result<T> = std::result::Result<T, ContextdError>;

impl ContextdError {
    /// Construct a validation error for a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ContextdError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Construct a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        ContextdError::Timeout {
            operation: operation.into(),
        }
    }

    /// Stable error code shared by the MCP and HTTP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            ContextdError::Validation { .. } => "VALIDATION_ERROR",
            ContextdError::NotFound(_) => "NOT_FOUND",
            ContextdError::PermissionDenied(_) => "PERMISSION_DENIED",
            ContextdError::Timeout { .. } | ContextdError::Cancelled => "TIMEOUT_ERROR",
            ContextdError::EmbedderBusy => "EMBEDDER_BUSY",
            ContextdError::ExternalUnavailable(_) | ContextdError::Http(_) => {
                "EXTERNAL_UNAVAILABLE"
            }
            ContextdError::Integrity(_) => "INTEGRITY_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Convert to user-facing string for MCP tool boundaries
    pub fn to_user_string(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

impl From<String> for ContextdError {
    fn from(s: String) -> Self {
        ContextdError::Internal(s)
    }
}

impl From<tokio::task::JoinError> for ContextdError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ContextdError::Cancelled
        } else {
            ContextdError::Internal(err.to_string())
        }
    }
}

impl From<ContextdError> for String {
    fn from(err: ContextdError) -> Self {
        err.to_user_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ContextdError::validation("name", "too long").code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(ContextdError::NotFound("c1".into()).code(), "NOT_FOUND");
        assert_eq!(ContextdError::EmbedderBusy.code(), "EMBEDDER_BUSY");
        assert_eq!(ContextdError::timeout("upsert").code(), "TIMEOUT_ERROR");
        assert_eq!(ContextdError::Cancelled.code(), "TIMEOUT_ERROR");
    }

    #[test]
    fn test_validation_message_carries_field() {
        let err = ContextdError::validation("summary", "exceeds 10000 chars");
        assert!(err.to_string().contains("summary"));
        assert!(err.to_string().contains("exceeds 10000 chars"));
    }
}
