use crate::codex_auth::AuthError;
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// A gateway-level failure, rendered in the Messages API error shape.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "proxy_error", message)
    }

    /// Maps a failed upstream call: non-2xx statuses are relayed, transport
    /// failures become 502.
    pub fn from_upstream(provider: &str, err: UpstreamCallError) -> Self {
        match (err.kind, err.status) {
            (UpstreamErrorKind::Http, Some(status)) => Self::new(
                status,
                "api_error",
                format!("{} API returned {}: {}", provider, status.as_u16(), err.message),
            ),
            _ => Self::proxy(format!("{} request failed: {}", provider, err.message)),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        Self::proxy(format!("codex credentials unavailable: {}", err))
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "type")]
    envelope_type: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            envelope_type: "error",
            error: ErrorBody {
                error_type: self.code,
                message: self.message,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
