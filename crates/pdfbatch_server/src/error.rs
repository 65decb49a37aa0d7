use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine_logging::engine_error;
use pdfbatch_engine::SessionError;
use serde_json::json;

/// JSON error body `{"success": false, "error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::InvalidSession(_)
            | SessionError::InvalidBatch { .. }
            | SessionError::UnknownArtifact(_) => StatusCode::NOT_FOUND,
            SessionError::SessionBusy(_) | SessionError::BatchCompleted { .. } => {
                StatusCode::CONFLICT
            }
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            engine_error!("Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
