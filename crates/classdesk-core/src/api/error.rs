use serde::Deserialize;
use thiserror::Error;

/// Transport-level failure of a backend call.
///
/// `Clone` so a single outcome can be handed to every caller waiting on a
/// coalesced refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payloads seen from the backend: `{message}` from the auth routes
/// and `{detail}` from framework-raised exceptions.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    detail: Option<serde_json::Value>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the human-readable message out of an error body, falling back to
    /// the (truncated) raw body.
    pub fn message_from_body(body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
            if let Some(message) = parsed.message.filter(|m| !m.is_empty()) {
                return message;
            }
            match parsed.detail {
                Some(serde_json::Value::String(detail)) => return detail,
                Some(other) => return Self::truncate_body(&other.to_string()),
                None => {}
            }
        }
        Self::truncate_body(body)
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::message_from_body(body);
        match status {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::BadRequest { status, message },
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// The server-provided message, if this error carries one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::AccessDenied(m)
            | ApiError::Unauthorized(m)
            | ApiError::NotFound(m)
            | ApiError::ServerError(m) => Some(m),
            ApiError::BadRequest { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}
