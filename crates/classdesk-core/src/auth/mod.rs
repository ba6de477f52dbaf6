//! Authentication module for managing the client session.
//!
//! This module provides:
//! - `SessionStore`: the observable, persisted record of who is logged in
//! - `AuthGateway`: login, signup, logout, refresh and password recovery
//! - `RecordStorage`: durable keyed records backing the session and cookies
//!
//! Only the gateway creates or destroys sessions; everything else reads
//! them through the store.

pub mod error;
pub mod gateway;
pub mod pending;
pub mod session;
pub mod storage;
pub mod token;

pub use error::AuthError;
pub use gateway::{AuthGateway, ExternalLogin};
pub use pending::PendingAuth;
pub use session::{Session, SessionState, SessionStore};
pub use storage::{FileStorage, MemoryStorage, RecordStorage};
pub use token::{decode_token, Claims};
