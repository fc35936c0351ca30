use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use whisklet_core::HostError;

/// Unified error type for HTTP responses.
///
/// Every per-request failure is converted here into a single JSON response of
/// the shape `{"error": true, "message": "..."}`; nothing propagates far
/// enough to crash the process and nothing is retried.
#[derive(Debug)]
pub struct AppError(pub HostError);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HostError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HostError::Load(_) | HostError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HostError::Manifest(_)
            | HostError::Io(_)
            | HostError::Yaml(_)
            | HostError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        error_response(status, &self.0.to_string())
    }
}

impl From<HostError> for AppError {
    fn from(err: HostError) -> Self {
        Self(err)
    }
}

/// Build the diagnostic JSON body used for all failed requests.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": true, "message": message });
    (status, axum::Json(body)).into_response()
}
