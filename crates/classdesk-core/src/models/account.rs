//! Request and response bodies of the `/api/auth` routes.

use serde::{Deserialize, Serialize};

use super::Role;

#[derive(Debug, Clone, Serialize)]
pub struct SignUpRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

/// Whatever the backend returns for a created account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignUpSummary {
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountUser {
    pub id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub user: AccountUser,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

impl LoginResponse {
    /// Approval lives at the top level of the login response; older
    /// deployments nested it under `user`. Absent means not approved.
    pub fn is_approved(&self) -> bool {
        self.is_active.or(self.user.is_active).unwrap_or(false)
    }

    /// Role of the account as reported by the server.
    pub fn account_role(&self) -> Option<Role> {
        self.user
            .role
            .as_deref()
            .or(self.role.as_deref())
            .and_then(|r| r.parse().ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailRequest<'a> {
    pub email: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpRequest<'a> {
    pub email: &'a str,
    pub otp: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetPasswordRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}
