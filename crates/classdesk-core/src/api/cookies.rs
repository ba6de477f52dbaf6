//! Cookie jar that survives restarts.
//!
//! The refresh credential is an HTTP-only cookie set by the backend. A
//! browser keeps it across reloads; this jar does the same by mirroring
//! its contents into record storage. The client talks to a single backend,
//! so cookies are keyed by name only.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest::Url;
use tracing::{debug, warn};

use crate::auth::storage::RecordStorage;

/// Storage key of the persisted cookie record
pub const COOKIE_RECORD_KEY: &str = "cookies";

pub struct PersistentCookieJar {
    storage: Arc<dyn RecordStorage>,
    cookies: Mutex<BTreeMap<String, String>>,
}

impl PersistentCookieJar {
    /// Create a jar seeded from storage. An unreadable record starts empty.
    pub fn new(storage: Arc<dyn RecordStorage>) -> Self {
        let cookies = match storage.load(COOKIE_RECORD_KEY) {
            Ok(Some(contents)) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable cookie record");
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read cookie record");
                BTreeMap::new()
            }
        };

        Self {
            storage,
            cookies: Mutex::new(cookies),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    /// Drop every cookie, e.g. when the user logs out.
    pub fn clear(&self) {
        let mut cookies = self.lock();
        cookies.clear();
        self.persist(&cookies);
    }

    /// Apply one `Set-Cookie` header value. Returns true if the jar changed.
    fn apply(cookies: &mut BTreeMap<String, String>, set_cookie: &str) -> bool {
        let mut parts = set_cookie.split(';');
        let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
            return false;
        };
        let name = name.trim();
        let value = value.trim().trim_matches('"');
        if name.is_empty() {
            return false;
        }

        let expired = parts.any(|attr| {
            let attr = attr.trim();
            attr.split_once('=')
                .map(|(k, v)| {
                    k.trim().eq_ignore_ascii_case("max-age")
                        && v.trim().parse::<i64>().map(|age| age <= 0).unwrap_or(false)
                })
                .unwrap_or(false)
        });

        if expired || value.is_empty() {
            cookies.remove(name).is_some()
        } else {
            cookies.insert(name.to_string(), value.to_string()).as_deref() != Some(value)
        }
    }

    fn persist(&self, cookies: &BTreeMap<String, String>) {
        let result = if cookies.is_empty() {
            self.storage.remove(COOKIE_RECORD_KEY)
        } else {
            serde_json::to_string(cookies)
                .map_err(anyhow::Error::from)
                .and_then(|contents| self.storage.save(COOKIE_RECORD_KEY, &contents))
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist cookies");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CookieStore for PersistentCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut cookies = self.lock();
        let mut changed = false;
        for header in cookie_headers {
            if let Ok(value) = header.to_str() {
                changed |= Self::apply(&mut cookies, value);
            }
        }
        if changed {
            debug!(host = ?url.host_str(), count = cookies.len(), "Cookies updated");
            self.persist(&cookies);
        }
    }

    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        let cookies = self.lock();
        if cookies.is_empty() {
            return None;
        }
        let header = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}
