use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::anthropic;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Upstream error bodies are previewed, never echoed in full.
pub(crate) const MAX_ERROR_PREVIEW: usize = 8 * 1024;

/// Gateway errors with stable kinds and HTTP status mapping.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Malformed JSON, missing model, empty messages, invalid enum values.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model not classifiable into a vendor family and no alias rewrites it.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The work-mode gate rejected the request.
    #[error("{0}")]
    WorkModeRejection(String),

    /// A content part cannot be translated to the target dialect.
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    /// Missing or unusable credential.
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// Unknown or expired resource, e.g. a tool-output submission for a
    /// response id that no longer exists.
    #[error("{0}")]
    NotFound(String),

    /// The resource is not in a state that allows the operation, e.g. a
    /// double tool-output submission.
    #[error("{0}")]
    Conflict(String),

    /// The upstream replied with a non-success status.
    #[error("Upstream error ({status}): {preview}")]
    UpstreamError {
        /// HTTP status returned by the upstream.
        status: u16,
        /// Body preview, capped at 8 KiB.
        preview: String,
    },

    /// The upstream could not be reached at the transport level.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The client closed the connection. Logged, never written to the wire.
    #[error("Request cancelled by client")]
    Cancelled,

    /// Any uncaught fault. If Some(message), it is safe to show; if None,
    /// details stay in the logs.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::UnknownModel(_)
            | Self::WorkModeRejection(_)
            | Self::UnsupportedContent(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UpstreamError { .. } | Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string for the response body.
    pub fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) | Self::WorkModeRejection(_) | Self::UnsupportedContent(_) | Self::Cancelled => {
                "invalid_request_error"
            }
            Self::UnknownModel(_) => "unknown_model",
            Self::Unauthenticated(_) => "authentication_error",
            Self::NotFound(_) => "not_found_error",
            Self::Conflict(_) => "conflict_error",
            Self::UpstreamError { .. } | Self::UpstreamUnavailable(_) => "api_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(message)) => message.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Truncate an upstream body to the preview cap on a char boundary.
pub(crate) fn preview_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_PREVIEW {
        return body.to_string();
    }

    let mut end = MAX_ERROR_PREVIEW;

    while !body.is_char_boundary(end) {
        end -= 1;
    }

    body[..end].to_string()
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// The same error, shaped for the Anthropic messages endpoint.
pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<LlmError> for AnthropicErrorResponse {
    fn from(error: LlmError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::from(error);

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            LlmError::WorkModeRejection("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(LlmError::Unauthenticated("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(LlmError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(LlmError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            LlmError::UpstreamError {
                status: 503,
                preview: "overloaded".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(LlmError::Internal(None).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_error_does_not_leak() {
        assert_eq!(LlmError::Internal(None).client_message(), "Internal server error");
        assert_eq!(
            LlmError::Internal(Some("quota exhausted".into())).client_message(),
            "quota exhausted"
        );
    }

    #[test]
    fn preview_is_capped() {
        let body = "x".repeat(MAX_ERROR_PREVIEW * 2);
        assert_eq!(preview_body(&body).len(), MAX_ERROR_PREVIEW);

        let short = "hello";
        assert_eq!(preview_body(short), "hello");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let mut body = "x".repeat(MAX_ERROR_PREVIEW - 1);
        body.push('é');
        body.push_str("tail");

        let preview = preview_body(&body);
        assert!(preview.len() <= MAX_ERROR_PREVIEW);
        assert!(preview.ends_with('x'));
    }
}
