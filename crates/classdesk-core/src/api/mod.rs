//! REST API plumbing for the learning platform backend.
//!
//! This module provides the `Transport` seam and its reqwest-backed
//! `HttpTransport`, the persisted cookie jar that carries the refresh
//! credential, and `ApiClient`, the shared request client whose
//! interceptor recovers from expired bearer tokens.

pub mod client;
pub mod cookies;
pub mod error;
pub mod transport;

pub use client::ApiClient;
pub use cookies::PersistentCookieJar;
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, RequestBody, Transport};
