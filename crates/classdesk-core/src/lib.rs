//! Core library for classdesk, a native client for the classdesk learning
//! platform.
//!
//! The crate owns the client-side session lifecycle: a persisted, observable
//! session store, an auth gateway that is the only place sessions are created
//! or destroyed, a request client that transparently recovers from expired
//! bearer tokens, and a route guard that gates the role-specific dashboards.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod models;
pub mod routing;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use app::App;
pub use auth::{AuthError, AuthGateway, Session, SessionState, SessionStore};
pub use config::Config;
pub use models::Role;
pub use routing::{GuardDecision, Page, Resolution, RouteGuard, Router};
