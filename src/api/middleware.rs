use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
///
/// The first five variants are the pipeline taxonomy returned to the UI. Messages
/// carried here must already be scrubbed of credentials.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Query rejected: {0}")]
    ValidationRejected(String),

    #[error("AI provider error: {0}")]
    Provider(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query timeout: {0}")]
    Timeout(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, as consumed by the UI
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationRejected(_) => "validation_rejected",
            AppError::Provider(_) => "provider_error",
            AppError::Connection(_) => "connection_error",
            AppError::Timeout(_) => "timeout_error",
            AppError::Execution(_) => "execution_error",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether re-sending the same request unchanged may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Provider(_) | AppError::Timeout(_) | AppError::Internal(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationRejected(_)
            | AppError::InvalidRequest(_)
            | AppError::Execution(_) => StatusCode::BAD_REQUEST,
            AppError::Provider(_) | AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The user-facing message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            AppError::ValidationRejected(msg)
            | AppError::Provider(msg)
            | AppError::Connection(msg)
            | AppError::Timeout(msg)
            | AppError::Execution(msg)
            | AppError::InvalidRequest(msg)
            | AppError::Internal(msg) => msg,
        }
    }

    /// Replace every occurrence of the given secrets in the message with `***`
    pub fn scrubbed(self, secrets: &[&str]) -> Self {
        let scrub = |msg: String| scrub_secrets(&msg, secrets);
        match self {
            AppError::ValidationRejected(msg) => AppError::ValidationRejected(scrub(msg)),
            AppError::Provider(msg) => AppError::Provider(scrub(msg)),
            AppError::Connection(msg) => AppError::Connection(scrub(msg)),
            AppError::Timeout(msg) => AppError::Timeout(scrub(msg)),
            AppError::Execution(msg) => AppError::Execution(scrub(msg)),
            AppError::InvalidRequest(msg) => AppError::InvalidRequest(scrub(msg)),
            AppError::Internal(msg) => AppError::Internal(scrub(msg)),
        }
    }
}

/// Mask credentials in an arbitrary message for safe display and logging.
/// Empty secrets are ignored so that an empty password does not mangle the text.
pub fn scrub_secrets(message: &str, secrets: &[&str]) -> String {
    let mut masked = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        masked = masked.replace(secret, "***");
    }
    masked
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        Self {
            error_kind: err.kind().to_string(),
            message: err.message().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!("Request failed ({}): {}", self.kind(), self.message());
        } else {
            tracing::info!("Request refused ({}): {}", self.kind(), self.message());
        }

        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_format() {
        let error = AppError::ValidationRejected("DROP is not allowed".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_codes_per_kind() {
        assert_eq!(AppError::Timeout("t".into()).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(AppError::Provider("p".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::Connection("c".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::Execution("e".into()).status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Timeout("slow".into()).is_retryable());
        assert!(AppError::Provider("down".into()).is_retryable());
        assert!(!AppError::ValidationRejected("no".into()).is_retryable());
        assert!(!AppError::Execution("unknown column".into()).is_retryable());
    }

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorResponse::from(&AppError::Timeout("Query exceeded 30s".to_string()));
        assert_eq!(detail.error_kind, "timeout_error");
        assert_eq!(detail.message, "Query exceeded 30s");
        assert!(detail.retryable);
    }

    #[test]
    fn test_scrubbed_removes_password() {
        let error = AppError::Connection(
            "password authentication failed for user \"app\" (password: hunter2)".to_string(),
        )
        .scrubbed(&["hunter2"]);
        assert!(!error.message().contains("hunter2"));
        assert!(error.message().contains("***"));
        assert_eq!(error.kind(), "connection_error");
    }

    #[test]
    fn test_scrub_ignores_empty_secret() {
        assert_eq!(scrub_secrets("no secrets here", &["", ""]), "no secrets here");
    }
}
