use crate::error::ServiceError;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::DetectionFailed(_) | ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::DetectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::MalformedEncoding(_) | ServiceError::Engine(_) | ServiceError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Errors render as `{"detail": "..."}`.
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::PayloadTooLarge(err.body_text())
        } else {
            ServiceError::Validation(format!("invalid multipart body: {}", err.body_text()))
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(err: JsonRejection) -> Self {
        ServiceError::Validation(format!("invalid JSON body: {}", err.body_text()))
    }
}

/// `Json` whose rejections use the `{"detail"}` error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ServiceError))]
pub struct JsonBody<T>(pub T);

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
