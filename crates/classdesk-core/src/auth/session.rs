//! Session store: the single source of truth for who is logged in.
//!
//! The store holds the current [`Session`] (or nothing), mirrors it to a
//! durable record on every change and publishes [`SessionState`] snapshots
//! to observers through a `watch` channel. Every transition bumps a
//! generation counter so late async results can detect that the session
//! they were issued under is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::storage::RecordStorage;
use super::token::{decode_token, Claims};
use crate::models::Role;

/// Storage key of the persisted session record
pub const SESSION_RECORD_KEY: &str = "session";

/// An authenticated principal. All four fields exist together or the
/// session does not exist at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub claims: Claims,
    pub role: Role,
    pub display_name: String,
}

impl Session {
    /// Build a session from a freshly issued token.
    pub fn from_token(
        token: String,
        role: Role,
        display_name: String,
    ) -> Result<Self, super::AuthError> {
        let claims = decode_token(&token)?;
        Ok(Self {
            token,
            claims,
            role,
            display_name,
        })
    }
}

/// Snapshot published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// True until `restore()` has run once.
    pub loading: bool,
    pub session: Option<Session>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }
}

/// Durable mirror of a session, field names kept flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    #[serde(rename = "accessToken")]
    access_token: String,
    user: Claims,
    role: String,
    #[serde(rename = "userName")]
    user_name: String,
}

impl SessionRecord {
    fn from_session(session: &Session) -> Self {
        Self {
            access_token: session.token.clone(),
            user: session.claims.clone(),
            role: session.role.as_str().to_string(),
            user_name: session.display_name.clone(),
        }
    }

    /// The token is decoded again rather than trusting the stored claims.
    fn into_session(self) -> Result<Session, String> {
        let role: Role = self.role.parse().map_err(|e| format!("{}", e))?;
        if self.access_token.is_empty() {
            return Err("empty access token".to_string());
        }
        let claims = decode_token(&self.access_token).map_err(|e| e.to_string())?;
        Ok(Session {
            token: self.access_token,
            claims,
            role,
            display_name: self.user_name,
        })
    }
}

struct StoreInner {
    storage: Arc<dyn RecordStorage>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    // Serialises transitions so generation, state and record change together.
    transition: Mutex<()>,
}

/// Cloneable handle to the shared session state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn RecordStorage>) -> Self {
        let (state, _) = watch::channel(SessionState {
            loading: true,
            session: None,
        });
        Self {
            inner: Arc::new(StoreInner {
                storage,
                state,
                generation: AtomicU64::new(0),
                transition: Mutex::new(()),
            }),
        }
    }

    pub fn storage(&self) -> Arc<dyn RecordStorage> {
        Arc::clone(&self.inner.storage)
    }

    /// Repopulate the session from the persisted record. Never fails: an
    /// absent or malformed record leaves the session empty.
    pub fn restore(&self) {
        let _guard = self.lock_transition();

        let session = match self.inner.storage.load(SESSION_RECORD_KEY) {
            Ok(Some(contents)) => match serde_json::from_str::<SessionRecord>(&contents)
                .map_err(|e| e.to_string())
                .and_then(SessionRecord::into_session)
            {
                Ok(session) => Some(session),
                Err(reason) => {
                    warn!(%reason, "Discarding malformed session record");
                    if let Err(e) = self.inner.storage.remove(SESSION_RECORD_KEY) {
                        warn!(error = %e, "Failed to erase malformed session record");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read session record");
                None
            }
        };

        debug!(restored = session.is_some(), "Session restore complete");
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.state.send_replace(SessionState {
            loading: false,
            session,
        });
    }

    /// Replace the whole session and overwrite the persisted record.
    pub fn commit(&self, session: Session) {
        let _guard = self.lock_transition();
        self.commit_locked(session);
    }

    /// Commit only if no other transition happened since `generation` was
    /// read. Returns false when the session was discarded as stale.
    pub fn commit_if_current(&self, generation: u64, session: Session) -> bool {
        let _guard = self.lock_transition();
        let current = self.generation();
        if current != generation {
            debug!(expected = generation, current, "Discarding stale session commit");
            return false;
        }
        self.commit_locked(session);
        true
    }

    /// Empty the session and erase the persisted record.
    pub fn clear(&self) {
        let _guard = self.lock_transition();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let was_authenticated = self.inner.state.borrow().session.is_some();
        self.inner.state.send_modify(|state| {
            state.loading = false;
            state.session = None;
        });
        if let Err(e) = self.inner.storage.remove(SESSION_RECORD_KEY) {
            warn!(error = %e, "Failed to erase session record");
        }
        if was_authenticated {
            info!("Session cleared");
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn current(&self) -> Option<Session> {
        self.inner.state.borrow().session.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().session.as_ref().map(|s| s.token.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    /// Counter bumped by every restore, commit and clear.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Observe session changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    fn commit_locked(&self, session: Session) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let record = SessionRecord::from_session(&session);
        match serde_json::to_string_pretty(&record) {
            Ok(contents) => {
                if let Err(e) = self.inner.storage.save(SESSION_RECORD_KEY, &contents) {
                    warn!(error = %e, "Failed to persist session record");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session record"),
        }

        info!(role = %session.role, user = %session.display_name, "Session committed");
        self.inner.state.send_replace(SessionState {
            loading: false,
            session: Some(session),
        });
    }

    fn lock_transition(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
