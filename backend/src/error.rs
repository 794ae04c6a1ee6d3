//! Standardized error handling for the Relay API
//!
//! This module provides a consistent error response format across all endpoints.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "BAD_REQUEST", "NOT_FOUND", "UNAUTHORIZED")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Request errors
    BadRequest(String),
    NotFound(String),
    Conflict(String),

    // Webhook ingress
    Unauthorized(String),
    /// Tenant resolution failed: the sender's workspace has no connected
    /// integration.
    ServiceNotConnected(String),

    // Server errors
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::ServiceNotConnected(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ServiceNotConnected(_) => "SERVICE_NOT_CONNECTED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Conflict(msg) => msg.clone(),
            Self::ServiceNotConnected(service) => {
                format!("No connected account for {service} — connect the service first")
            }
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = ApiError::new(self.error_code(), self.message());
        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            AppError::Unauthorized("bad signature".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceNotConnected("slack".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("Automation".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn connect_message_names_the_service() {
        let msg = AppError::ServiceNotConnected("notion".into()).message();
        assert!(msg.contains("notion"));
        assert!(msg.contains("connect"));
    }
}
