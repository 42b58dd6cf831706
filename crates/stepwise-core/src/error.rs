// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stepwise-core.
//!
//! Provides a unified error type that maps to HTTP error responses.

use std::fmt;

use axum::http::StatusCode;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while scheduling, checkpointing or finalizing runs.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    /// The caller could not be authenticated.
    Unauthorized {
        /// Why authentication failed.
        message: String,
    },

    /// Request body could not be decoded.
    InvalidBody {
        /// Decoder message.
        message: String,
    },

    /// An opcode cannot be processed on this path.
    InvalidOpcode {
        /// Name of the opcode.
        opcode: String,
        /// Why it was rejected.
        message: String,
    },

    /// Run was not found in the state store.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run metadata was not found.
    MetadataNotFound {
        /// The run ID whose metadata is missing.
        run_id: String,
    },

    /// Function was not found.
    FunctionNotFound {
        /// The function ID or slug that was not found.
        function: String,
    },

    /// A run with the same identifier has already been scheduled.
    IdentifierExists {
        /// The conflicting run ID.
        run_id: String,
    },

    /// A different output was already saved for this step.
    DuplicateResponse {
        /// The step ID.
        step_id: String,
    },

    /// The same output was already saved for this step.
    IdempotentResponse {
        /// The step ID.
        step_id: String,
    },

    /// The function exceeded its rate limit.
    RateLimited {
        /// The rate limited function.
        function_id: String,
    },

    /// A backend is temporarily unavailable.
    Unavailable {
        /// The unavailable backend.
        service: String,
        /// Error details.
        details: String,
    },

    /// State store operation failed.
    StateError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Queue operation failed.
    QueueError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Executor call failed.
    ExecutorError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Any other failure.
    Internal {
        /// Error details.
        message: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::InvalidBody { .. } => "INVALID_BODY",
            Self::InvalidOpcode { .. } => "INVALID_OPCODE",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::MetadataNotFound { .. } => "METADATA_NOT_FOUND",
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::IdentifierExists { .. } => "IDENTIFIER_EXISTS",
            Self::DuplicateResponse { .. } => "DUPLICATE_RESPONSE",
            Self::IdempotentResponse { .. } => "IDEMPOTENT_RESPONSE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::StateError { .. } => "STATE_ERROR",
            Self::QueueError { .. } => "QUEUE_ERROR",
            Self::ExecutorError { .. } => "EXECUTOR_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error is reported with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidBody { .. } | Self::InvalidOpcode { .. } => StatusCode::BAD_REQUEST,
            Self::RunNotFound { .. }
            | Self::MetadataNotFound { .. }
            | Self::FunctionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::IdentifierExists { .. }
            | Self::DuplicateResponse { .. }
            | Self::IdempotentResponse { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a step write was dropped because the step already had output.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::DuplicateResponse { .. } | Self::IdempotentResponse { .. }
        )
    }

    /// Whether the run or its metadata is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. } | Self::MetadataNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized { message } => write!(f, "Unauthorized: {}", message),
            Self::InvalidBody { message } => write!(f, "Invalid request body: {}", message),
            Self::InvalidOpcode { opcode, message } => {
                write!(f, "Cannot checkpoint opcode '{}': {}", opcode, message)
            }
            Self::RunNotFound { run_id } => write!(f, "Run '{}' not found", run_id),
            Self::MetadataNotFound { run_id } => {
                write!(f, "Metadata for run '{}' not found", run_id)
            }
            Self::FunctionNotFound { function } => {
                write!(f, "Function '{}' not found", function)
            }
            Self::IdentifierExists { run_id } => write!(f, "Run '{}' already exists", run_id),
            Self::DuplicateResponse { step_id } => {
                write!(f, "Step '{}' already has a different output", step_id)
            }
            Self::IdempotentResponse { step_id } => {
                write!(f, "Step '{}' already has this output", step_id)
            }
            Self::RateLimited { function_id } => {
                write!(f, "Rate limits exceeded for function '{}'", function_id)
            }
            Self::Unavailable { service, details } => {
                write!(f, "{} unavailable: {}", service, details)
            }
            Self::StateError { operation, details } => {
                write!(f, "State error during '{}': {}", operation, details)
            }
            Self::QueueError { operation, details } => {
                write!(f, "Queue error during '{}': {}", operation, details)
            }
            Self::ExecutorError { operation, details } => {
                write!(f, "Executor error during '{}': {}", operation, details)
            }
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::StateError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::StateError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
