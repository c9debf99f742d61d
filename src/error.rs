use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::store::StoreError;
use crate::supervisor::SupervisorError;
use crate::transport::TransportError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Upstream(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn not_connected() -> Self {
        ApiError::BadRequest("NOT_CONNECTED", "WhatsApp is not connected".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => ApiError::Conflict("CONFLICT", msg),
            other => ApiError::Internal(format!("db error: {other}")),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => ApiError::not_connected(),
            other => ApiError::Upstream("TRANSPORT_ERROR", other.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Transport(t) => t.into(),
            SupervisorError::Stopped => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Upstream(code, msg) => {
                tracing::warn!(code, message = %msg, "upstream failure");
                (StatusCode::BAD_GATEWAY, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::to_error_response("INTERNAL", &msg),
                )
                    .into_response()
            }
        }
    }
}
