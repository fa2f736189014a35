use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// モデル未読込時の応答本文
pub const MODEL_NOT_LOADED: &str = "Error: Model not loaded. Run 'recover_model' first.";

/// HTTPハンドラのエラー
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{}", MODEL_NOT_LOADED)]
    ModelNotLoaded,
    #[error("{0}")]
    BadRequest(String),
    #[error("upload is too large: {0}")]
    PayloadTooLarge(String),
    #[error("uploaded file is not a readable image: {0}")]
    UnreadableImage(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::UnreadableImage(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ModelNotLoaded | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::warn!(status = status.as_u16(), "{}", self);
        }
        (status, self.to_string()).into_response()
    }
}
