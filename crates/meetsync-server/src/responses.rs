//! API response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meetsync_jobs::QueueError;
use serde::{Deserialize, Serialize};

/// Error body returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    /// Creates a successful response.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Application error type for Axum.
#[derive(Debug)]
pub struct AppError(pub QueueError);

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        Self(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            QueueError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            QueueError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            QueueError::Duplicate(_) => (StatusCode::CONFLICT, "DUPLICATE"),
            QueueError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            QueueError::BackendUnavailable(_) | QueueError::Redis(_) | QueueError::Pool(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = Json(ApiResponse::<()>::error(ErrorResponse {
            code: code.to_string(),
            message: self.0.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Result type for Axum handlers.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

/// Helper to create a success response.
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}
