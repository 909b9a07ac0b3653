use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model is not loaded: {0}")]
    ModelLoading(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("upload exceeds the configured size limit")]
    PayloadTooLarge,
    #[error("image decoding failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("invalid preprocessor config: {0}")]
    Preprocessor(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::ModelLoading(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            // An undecodable upload is not handled specially; it surfaces as a server error.
            ServiceError::ImageDecode(_)
            | ServiceError::Preprocessor(_)
            | ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
