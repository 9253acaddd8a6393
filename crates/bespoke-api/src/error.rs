//! API error types and HTTP response mapping.
//!
//! Every error response carries a stable machine-readable code from the
//! executor's taxonomy. Responses never contain process-internal detail;
//! unexpected conditions are logged and surfaced as `internal`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use bespoke_flow::error::Error as FlowError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// A submitted workflow failed declared validation.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-schema", message)
    }

    /// A list filter could not be parsed.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid-filter", message)
    }

    /// The requested submission or task does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not-found", message)
    }

    /// The queue backend is unreachable.
    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "queue-unavailable", message)
    }

    /// Any unexpected condition.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<FlowError> for ApiError {
    fn from(value: FlowError) -> Self {
        match value {
            FlowError::InvalidWorkflow { reasons } => Self::invalid_schema(reasons.join("; ")),
            FlowError::SubmissionNotFound { id } => {
                Self::not_found(format!("submission not found: {id}"))
            }
            FlowError::TaskNotFound { id } => Self::not_found(format!("task not found: {id}")),
            FlowError::QueueUnavailable { message } => Self::queue_unavailable(message),
            other => {
                // Logged here; the response carries no internal detail.
                tracing::error!(error = %other, "internal error surfaced to API");
                Self::internal("internal error")
            }
        }
    }
}
