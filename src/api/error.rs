// src/api/error.rs
// Centralized error handling for HTTP API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::error::ContextdError;

/// Standard API error response format: `{error: {code, message, details?}}`.
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub status_code: StatusCode,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "VALIDATION_ERROR",
            message: message.into(),
            details: None,
            status_code: StatusCode::BAD_REQUEST,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("{message}");
        Self {
            code: "INTERNAL_ERROR",
            message,
            details: None,
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ContextdError> for ApiError {
    fn from(err: ContextdError) -> Self {
        let code = err.code();
        let status_code = match code {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
            "TIMEOUT_ERROR" => StatusCode::GATEWAY_TIMEOUT,
            "EMBEDDER_BUSY" => StatusCode::SERVICE_UNAVAILABLE,
            "EXTERNAL_UNAVAILABLE" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status_code.is_server_error() {
            error!("API error: {err}");
        }
        Self {
            code,
            message: err.to_string(),
            details: None,
            status_code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (self.status_code, Json(body)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = ApiError::from(ContextdError::validation("percent", "out of range"));
        assert_eq!(err.status_code, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "VALIDATION_ERROR");

        let err = ApiError::from(ContextdError::NotFound("c1".into()));
        assert_eq!(err.status_code, StatusCode::NOT_FOUND);

        let err = ApiError::from(ContextdError::EmbedderBusy);
        assert_eq!(err.status_code, StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::from(ContextdError::PermissionDenied("nope".into()));
        assert_eq!(err.status_code, StatusCode::FORBIDDEN);
    }
}
