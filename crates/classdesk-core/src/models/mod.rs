//! Data models shared by the auth gateway, session store and route guard.

pub mod account;
pub mod role;

pub use account::{
    AccountUser, EmailRequest, LoginResponse, MessageResponse, OtpRequest, ResetPasswordRequest,
    SignUpRequest, SignUpSummary, TokenResponse,
};
pub use role::{Role, UnknownRole};
