//! Error types for history cleanup

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error raised when a time-of-day string matches neither accepted format
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid time of day {input:?}: expected HH:mm or HH:mmZ (e.g. 22:00+0100)")]
pub struct TimeOfDayParseError {
    pub input: String,
}

/// History cleanup error types
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error(transparent)]
    ParseError(#[from] TimeOfDayParseError),
}

/// Result type alias using CleanupError
pub type Result<T> = std::result::Result<T, CleanupError>;

impl IntoResponse for CleanupError {
    fn into_response(self) -> Response {
        let status = match &self {
            CleanupError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CleanupError::ConfigurationError(_) | CleanupError::ParseError(_) => {
                StatusCode::BAD_REQUEST
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl CleanupError {
    /// Window evaluation requested while no batch window is configured
    pub fn window_not_configured() -> Self {
        CleanupError::ConfigurationError("Batch window must be configured".into())
    }
}

impl From<sqlx::Error> for CleanupError {
    fn from(err: sqlx::Error) -> Self {
        CleanupError::DatabaseError(err.to_string())
    }
}
