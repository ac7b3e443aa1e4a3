//! Error types for Fista services
//!
//! Provides a single error taxonomy with:
//! - Distinct variants for query validation, backend, and history failures
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Query validation (1xxx)
    EmptyQuery,
    QueryTooLong,
    ValidationError,

    // Resources (4xxx)
    ConversationNotFound,
    MessageNotFound,
    BackendNotFound,

    // Conflicts (5xxx)
    MessageImmutable,

    // Rate limiting (6xxx)
    RateLimited,

    // Backends (8xxx)
    BackendUnavailable,
    AllBackendsFailed,

    // Internal (9xxx)
    ConfigurationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::EmptyQuery => 1001,
            ErrorCode::QueryTooLong => 1002,
            ErrorCode::ValidationError => 1003,

            ErrorCode::ConversationNotFound => 4001,
            ErrorCode::MessageNotFound => 4002,
            ErrorCode::BackendNotFound => 4003,

            ErrorCode::MessageImmutable => 5001,

            ErrorCode::RateLimited => 6001,

            ErrorCode::BackendUnavailable => 8001,
            ErrorCode::AllBackendsFailed => 8002,

            ErrorCode::ConfigurationError => 9002,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Query validation
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Query too long: {length} characters exceeds limit of {limit}")]
    QueryTooLong { length: usize, limit: usize },

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Resources
    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Backend not found: {name}")]
    BackendNotFound { name: String },

    #[error("Message {id} is finalized and can no longer change")]
    MessageImmutable { id: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Backends
    #[error("Backend {backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// Also the text of a failed turn's agent message
    #[error("search failed: {message}")]
    AllBackendsFailed { message: String },

    // Internal
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::EmptyQuery => ErrorCode::EmptyQuery,
            AppError::QueryTooLong { .. } => ErrorCode::QueryTooLong,
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::ConversationNotFound { .. } => ErrorCode::ConversationNotFound,
            AppError::MessageNotFound { .. } => ErrorCode::MessageNotFound,
            AppError::BackendNotFound { .. } => ErrorCode::BackendNotFound,
            AppError::MessageImmutable { .. } => ErrorCode::MessageImmutable,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::BackendUnavailable { .. } => ErrorCode::BackendUnavailable,
            AppError::AllBackendsFailed { .. } => ErrorCode::AllBackendsFailed,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::EmptyQuery | AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::ConversationNotFound { .. }
            | AppError::MessageNotFound { .. }
            | AppError::BackendNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::MessageImmutable { .. } => StatusCode::CONFLICT,

            // 413 Payload Too Large
            AppError::QueryTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::BackendUnavailable { .. } | AppError::AllBackendsFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::QueryTooLong { length, limit } => {
                Some(serde_json::json!({ "length": length, "limit": limit }))
            }
            AppError::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}
