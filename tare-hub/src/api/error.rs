use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::session::SessionError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    /// The board exists but cannot take the request in its current state.
    Conflict(String),
    /// The board did not accept the command.
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = ErrorResponse {
            success: false,
            message,
            error: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected(_) | SessionError::AlreadyStarted(_) => {
                ApiError::Conflict(err.to_string())
            }
            SessionError::Connect { .. } | SessionError::Send { .. } => {
                ApiError::BadGateway(err.to_string())
            }
        }
    }
}
