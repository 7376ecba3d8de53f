use axum::{
    Json,
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::error;

use quill_types::api::ErrorResponse;

/// Request-path failures. Each maps to one status code and a `{"message"}` body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    /// Absent and not-owned look the same to the caller.
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Internal {
        message: String,
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Builds a `map_err` adapter that turns any error into a 500 with a fixed
    /// client-facing message.
    pub fn internal<E>(message: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        move |e| Self::Internal {
            message: message.to_string(),
            source: e.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Internal { message, source } => {
                error!("{}: {:#}", message, source);
                message
            }
            Self::Validation(message) | Self::Unauthorized(message) | Self::NotFound(message) => message,
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

/// Parses a JSON request body. An empty body reads as `{}` so that a missing
/// field is reported as such instead of as a syntax error.
pub fn parse_json<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) { b"{}" } else { &body[..] };
    serde_json::from_slice(raw).map_err(|e| ApiError::validation(format!("Invalid request body: {}", e)))
}

/// Trims an identifier field; blank counts as absent.
pub fn required(field: Option<String>) -> Option<String> {
    field
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Free text is kept exactly as sent; blank still counts as absent.
pub fn non_blank(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.trim().is_empty())
}
