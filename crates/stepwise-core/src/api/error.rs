// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error responses of the checkpoint API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;

/// Failure of a checkpoint API request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// The request could not be decoded.
    #[error("{0}")]
    BadRequest(String),

    /// The run or function is unknown.
    #[error("{0}")]
    NotFound(String),

    /// The run already exists.
    #[error("{0}")]
    Conflict(String),

    /// The function is over its rate limit.
    #[error("{0}")]
    RateLimited(String),

    /// A backend is temporarily unavailable.
    #[error("{0}")]
    Unavailable(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub error: String,
    /// Human readable message.
    pub message: String,
    /// HTTP status.
    pub code: u16,
}

impl ApiError {
    /// HTTP status of this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            ApiError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert to the JSON error body.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
            code: self.status_code().as_u16(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err.http_status() {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::BAD_REQUEST => ApiError::BadRequest(message),
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::CONFLICT => ApiError::Conflict(message),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited(message),
            StatusCode::SERVICE_UNAVAILABLE => ApiError::Unavailable(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_response();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "checkpoint API error");
        } else {
            tracing::debug!(error = %self, status = %status, "checkpoint API rejected request");
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_core_error() {
        let fixtures = vec![
            (
                CoreError::Unauthorized {
                    message: "bad key".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                CoreError::RunNotFound {
                    run_id: "r".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                CoreError::InvalidOpcode {
                    opcode: "Sleep".to_string(),
                    message: "async".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                CoreError::IdentifierExists {
                    run_id: "r".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::RateLimited {
                    function_id: "f".to_string(),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                CoreError::Internal {
                    message: "x".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in fixtures {
            assert_eq!(ApiError::from(err.clone()).status_code(), expected, "{:?}", err);
        }
    }

    #[test]
    fn test_unauthorized_hides_details() {
        let body = ApiError::from(CoreError::Unauthorized {
            message: "token expired".to_string(),
        })
        .to_response();
        assert_eq!(body.message, "unauthorized");
        assert_eq!(body.error, "UNAUTHORIZED");
        assert_eq!(body.code, 401);
    }
}
