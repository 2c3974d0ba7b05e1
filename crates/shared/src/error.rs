//! Error types for PlexMCP

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlexError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlexError {
    /// Map an API error envelope back onto the shared error type
    pub fn from_api(status: u16, body: &ApiErrorBody) -> Self {
        let message = body.error.message.clone();
        match (status, body.error.code.as_str()) {
            (401, _) | (403, _) => PlexError::Auth(message),
            (404, _) => PlexError::NotFound(message),
            (429, _) => PlexError::RateLimited,
            (_, "VALIDATION_ERROR") | (_, "BAD_REQUEST") => PlexError::Validation(message),
            (400..=499, _) => PlexError::Validation(message),
            _ => PlexError::Internal(message),
        }
    }
}

/// JSON error body returned by the PlexMCP API
///
/// Shape: `{"error": {"code": "NOT_FOUND", "message": "Resource not found"}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}
