use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pulsewatch_core::QueueError;
use serde_json::json;

/// Maps the core error taxonomy onto HTTP status codes (§7's propagation
/// policy: validation/config failures are caller errors, everything else is
/// either not-found or a transient server condition).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] pulsewatch_core::Error),

    #[error("not found")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Core(pulsewatch_core::Error::NotFound(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Core(pulsewatch_core::Error::Validation(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Core(pulsewatch_core::Error::Queue(QueueError::NotFound(id))) => (StatusCode::NOT_FOUND, format!("job {id} not found")),
            ApiError::Core(pulsewatch_core::Error::Queue(e)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Core(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
