use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blob_store::BlobError;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct BlobstoreAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl BlobstoreAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }

    pub fn internal_error(e: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
    }
}

impl IntoResponse for BlobstoreAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<BlobError> for BlobstoreAPIError {
    fn from(e: BlobError) -> Self {
        let status_code = match &e {
            BlobError::NotFound { .. } => StatusCode::NOT_FOUND,
            BlobError::OffsetMismatch { .. } => StatusCode::BAD_REQUEST,
            BlobError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

/// Query parameters accepted on file paths.
#[derive(Debug, Default, Deserialize)]
pub struct FileParams {
    pub dir: Option<String>,
    pub offset: Option<String>,
}
