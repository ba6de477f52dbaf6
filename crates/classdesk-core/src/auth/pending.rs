//! Marker for an external (Google) login that left the client and will
//! come back through a callback.
//!
//! The marker is written before the user is sent away and consumed exactly
//! once when they return. There is no polling.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::storage::RecordStorage;

/// Storage key of the pending external-login marker
pub const PENDING_AUTH_KEY: &str = "pending_auth";

/// How long a started external login may take before the marker is void.
const PENDING_AUTH_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuth {
    pub state: String,
    pub return_to: String,
    pub created_at: DateTime<Utc>,
}

impl PendingAuth {
    pub fn new(return_to: &str) -> Self {
        let bytes: [u8; 16] = rand::random();
        let state = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            state,
            return_to: return_to.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.created_at + Duration::minutes(PENDING_AUTH_TTL_MINUTES)
    }

    pub fn save(&self, storage: &dyn RecordStorage) -> Result<()> {
        let contents = serde_json::to_string(self).context("Failed to serialize pending login")?;
        storage.save(PENDING_AUTH_KEY, &contents)
    }

    /// Load and erase the marker. A second call returns `None`.
    pub fn take(storage: &dyn RecordStorage) -> Result<Option<Self>> {
        let Some(contents) = storage.load(PENDING_AUTH_KEY)? else {
            return Ok(None);
        };
        storage.remove(PENDING_AUTH_KEY)?;
        let pending = serde_json::from_str(&contents).context("Failed to parse pending login")?;
        Ok(Some(pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;

    #[test]
    fn test_state_is_random_hex() {
        let a = PendingAuth::new("/student-dashboard");
        let b = PendingAuth::new("/student-dashboard");
        assert_eq!(a.state.len(), 32);
        assert!(a.state.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.state, b.state);
    }

    #[test]
    fn test_take_consumes_once() {
        let storage = MemoryStorage::new();
        let pending = PendingAuth::new("/teacher-dashboard");
        pending.save(&storage).unwrap();

        assert_eq!(PendingAuth::take(&storage).unwrap(), Some(pending));
        assert_eq!(PendingAuth::take(&storage).unwrap(), None);
    }

    #[test]
    fn test_expiry() {
        let mut pending = PendingAuth::new("/");
        assert!(!pending.is_expired());
        pending.created_at = Utc::now() - Duration::minutes(11);
        assert!(pending.is_expired());
    }

    #[test]
    fn test_take_erases_corrupt_marker() {
        let storage = MemoryStorage::new();
        storage.save(PENDING_AUTH_KEY, "not json").unwrap();
        assert!(PendingAuth::take(&storage).is_err());
        assert!(storage.load(PENDING_AUTH_KEY).unwrap().is_none());
    }
}
