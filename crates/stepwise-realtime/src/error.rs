// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the realtime layer.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type using RealtimeError
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors raised by the broadcaster, the subscription adapters and the realtime API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RealtimeError {
    /// The broadcaster is shutting down and rejects new work.
    #[error("broadcaster is closed")]
    BroadcasterClosed,

    /// The topic lifecycle hook refused to start a topic.
    #[error("error starting topic: {0}")]
    TopicStart(String),

    /// A write was attempted on a subscription that has already been closed.
    #[error("subscription {0} is closed")]
    SubscriptionClosed(uuid::Uuid),

    /// Writing to the underlying transport failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Message failed validation before publishing.
    #[error("{0}")]
    Validation(String),

    /// Request body could not be parsed.
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// No credentials were supplied.
    #[error("unauthorized")]
    Unauthorized,

    /// Credentials were supplied but failed verification.
    #[error("invalid token")]
    InvalidToken,

    /// The realtime token expired.
    #[error("token expired")]
    ExpiredToken,

    /// Cross-process replication failed.
    #[error("replication error: {0}")]
    Replication(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body returned by the realtime HTTP API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine readable error code.
    pub error: String,
    /// Human readable message.
    pub message: String,
    /// HTTP status code.
    pub code: u16,
}

impl RealtimeError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::InvalidToken | Self::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::Validation(_) | Self::InvalidBody(_) | Self::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::BroadcasterClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BroadcasterClosed => "BROADCASTER_CLOSED",
            Self::TopicStart(_) => "TOPIC_START_FAILED",
            Self::SubscriptionClosed(_) => "SUBSCRIPTION_CLOSED",
            Self::Write(_) => "WRITE_FAILED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidBody(_) => "INVALID_BODY",
            // Auth failures are reported identically.
            Self::Unauthorized | Self::InvalidToken | Self::ExpiredToken => "UNAUTHORIZED",
            Self::Replication(_) => "REPLICATION_ERROR",
            Self::Serialization(_) => "INVALID_BODY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert to the JSON error body.
    pub fn to_response(&self) -> ErrorResponse {
        let message = match self {
            Self::Unauthorized | Self::InvalidToken | Self::ExpiredToken => {
                "unauthorized".to_string()
            }
            other => other.to_string(),
        };
        ErrorResponse {
            error: self.error_code().to_string(),
            message,
            code: self.status_code().as_u16(),
        }
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = self.to_response();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "realtime API error");
        } else {
            tracing::debug!(error = %self, status = %status, "realtime API rejected request");
        }

        (status, Json(response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let fixtures = vec![
            (RealtimeError::Unauthorized, StatusCode::UNAUTHORIZED),
            (RealtimeError::InvalidToken, StatusCode::UNAUTHORIZED),
            (RealtimeError::ExpiredToken, StatusCode::UNAUTHORIZED),
            (
                RealtimeError::Validation("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                RealtimeError::BroadcasterClosed,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RealtimeError::Write("eof".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in fixtures {
            assert_eq!(error.status_code(), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_auth_errors_are_indistinguishable() {
        let a = RealtimeError::Unauthorized.to_response();
        let b = RealtimeError::InvalidToken.to_response();
        let c = RealtimeError::ExpiredToken.to_response();

        assert_eq!(a.error, b.error);
        assert_eq!(b.error, c.error);
        assert_eq!(a.message, c.message);
        assert_eq!(a.code, 401);
    }
}
