use thiserror::Error;

use crate::api::ApiError;

/// Failures surfaced by the auth gateway to calling UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Account not approved yet")]
    NotApproved,

    #[error("Unable to reach server: {0}")]
    Network(String),

    #[error("Malformed access token: {0}")]
    TokenDecode(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Backend detail returned for accounts that exist but are not activated.
const INACTIVE_DETAIL: &str = "Inactive user";

impl AuthError {
    /// Classify a failed login call.
    pub(crate) fn from_login(err: ApiError) -> Self {
        match err {
            ApiError::BadRequest { ref message, .. } if message == INACTIVE_DETAIL => {
                AuthError::NotApproved
            }
            ApiError::Unauthorized(message)
            | ApiError::AccessDenied(message)
            | ApiError::NotFound(message)
            | ApiError::BadRequest { message, .. } => AuthError::InvalidCredentials(message),
            other => Self::from_transport(other),
        }
    }

    /// Classify a failed form submission (signup, password recovery).
    pub(crate) fn from_submission(err: ApiError) -> Self {
        match err {
            ApiError::BadRequest { message, .. }
            | ApiError::Unauthorized(message)
            | ApiError::AccessDenied(message)
            | ApiError::NotFound(message) => AuthError::Validation(message),
            other => Self::from_transport(other),
        }
    }

    /// Classify a failed refresh call. Any rejection means the refresh
    /// credential is no longer usable.
    pub(crate) fn from_refresh(err: ApiError) -> Self {
        match err {
            ApiError::Network(message) => AuthError::Network(message),
            other => AuthError::SessionExpired(other.to_string()),
        }
    }

    fn from_transport(err: ApiError) -> Self {
        match err {
            ApiError::Network(message) => AuthError::Network(message),
            ApiError::RateLimited => AuthError::Server(err.to_string()),
            ApiError::ServerError(message) => AuthError::Server(message),
            ApiError::InvalidResponse(message) => AuthError::Server(message),
            other => AuthError::Server(other.to_string()),
        }
    }
}
