//! Scripted transport and fixtures shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::storage::MemoryStorage;
use crate::auth::token::make_token;
use crate::auth::{AuthGateway, SessionStore};

pub(crate) const BASE_URL: &str = "http://test.local";

enum Scripted {
    Respond(ApiResponse),
    Fail(ApiError),
}

/// Replays queued responses per path and records every request it sees.
/// A path can be gated so its responses are held until the test releases
/// them.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<ApiRequest>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, path: &str, status: u16, body: serde_json::Value) {
        let body = if body.is_null() { String::new() } else { body.to_string() };
        self.push(path, Scripted::Respond(ApiResponse { status, body }));
    }

    pub(crate) fn fail(&self, path: &str, err: ApiError) {
        self.push(path, Scripted::Fail(err));
    }

    /// Hold responses for `path` until permits are added to the returned gate.
    pub(crate) fn gate(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(path.to_string(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    fn push(&self, path: &str, scripted: Scripted) {
        self.script
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(scripted);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());

        let gate = self.gates.lock().unwrap().get(&request.path).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(ApiError::Network(format!("no scripted response for {}", request.path))),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", BASE_URL, path)
    }
}

/// Access token with the given subject and extra claims.
pub(crate) fn token_for(sub: &str, extra: serde_json::Value) -> String {
    let mut claims = json!({"sub": sub, "exp": 9999999999i64});
    if let (Some(target), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
    make_token(&claims)
}

pub(crate) fn login_body(token: &str, role: &str, is_active: Option<bool>) -> serde_json::Value {
    let mut body = json!({
        "access_token": token,
        "token_type": "bearer",
        "user": {"id": "u-1", "email": "ada@example.com", "username": "Ada", "role": role},
        "role": role,
        "is_superuser": false
    });
    if let Some(active) = is_active {
        body["is_active"] = json!(active);
    }
    body
}

/// Gateway over a scripted transport and in-memory storage, already restored.
pub(crate) fn gateway() -> (AuthGateway, Arc<ScriptedTransport>, Arc<MemoryStorage>) {
    let transport = ScriptedTransport::new();
    let storage = Arc::new(MemoryStorage::new());
    let store = SessionStore::new(storage.clone());
    store.restore();
    let gateway = AuthGateway::new(transport.clone(), store);
    (gateway, transport, storage)
}
