//! Mapping from core errors to HTTP responses.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use intercom_core::{Error, ErrorBody};
use tracing::warn;

#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    /// The request is well-formed but contradicts current state.
    Conflict(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Core(e) if e.is_conflict() => StatusCode::CONFLICT,
            ApiError::Core(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Core(Error::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Core(Error::invalid_request(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Core(Error::invalid_request(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Core(e) => e.to_string(),
            ApiError::Conflict(message) => message,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", message);
        }
        (status, Json(ErrorBody::new(message))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
