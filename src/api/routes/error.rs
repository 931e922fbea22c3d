//! API error handling utilities.

use crate::services::ServiceError;
use crate::storage::StorageError;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::error;

/// API error response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "ValidationFailed",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16(),
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound { .. } | ServiceError::ScopeNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ServiceError::RuleInUse { .. }
            | ServiceError::ConnectionInUse { .. }
            | ServiceError::ScopeInUse { .. } => StatusCode::CONFLICT,
            ServiceError::DiscoveryFailed { .. } | ServiceError::PluginFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Storage(StorageError::Conflict { .. }) => StatusCode::CONFLICT,
            ServiceError::Storage(e) => {
                error!("Storage failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::ExecutionAborted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

/// Decode a JSON body into `T`, reporting shape errors as `ValidationFailed`.
pub fn decode<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("invalid payload: {}", e)))
}
