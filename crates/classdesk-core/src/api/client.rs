//! Shared request client with the expired-token interceptor.
//!
//! Every request runs through a small state machine:
//!
//! ```text
//! SENT -> DONE                                  (anything but 401)
//! SENT -> REFRESHING -> RETRIED -> DONE         (refresh ok, retry answered)
//! SENT -> REFRESHING -> LOGGED_OUT              (refresh failed, original 401)
//! ```
//!
//! A request is retried at most once. A retry that also answers 401 is
//! surfaced to the caller without another refresh.

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::AuthGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sent,
    Refreshing,
    Retried,
    Done,
    LoggedOut,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Sent => "SENT",
            Phase::Refreshing => "REFRESHING",
            Phase::Retried => "RETRIED",
            Phase::Done => "DONE",
            Phase::LoggedOut => "LOGGED_OUT",
        })
    }
}

/// API client for page-level callers.
/// Clone is cheap - the transport and gateway are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    gateway: AuthGateway,
}

impl ApiClient {
    pub fn new(gateway: AuthGateway) -> Self {
        Self {
            transport: gateway.transport(),
            gateway,
        }
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    /// Send a request with the current bearer token attached, recovering
    /// from one expired-token response.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let store = self.gateway.store();
        let generation = store.generation();
        let mut bearer = store.token();
        let mut phase = Phase::Sent;
        let mut original_401: Option<ApiError> = None;

        loop {
            debug!(method = %request.method, path = %request.path, %phase, "Request phase");

            if phase == Phase::Refreshing {
                let original = original_401
                    .take()
                    .unwrap_or_else(|| ApiError::Unauthorized("unauthorized".to_string()));

                match store.token() {
                    None => {
                        debug!(path = %request.path, phase = %Phase::LoggedOut, "No session to refresh");
                        return Err(original);
                    }
                    // Someone else already replaced the token this request used.
                    Some(current)
                        if store.generation() != generation
                            && bearer.as_deref() != Some(current.as_str()) =>
                    {
                        debug!(path = %request.path, "Session moved on since request was sent");
                        bearer = Some(current);
                    }
                    Some(_) => match self.gateway.refresh().await {
                        Ok(session) => bearer = Some(session.token),
                        Err(e) => {
                            warn!(path = %request.path, phase = %Phase::LoggedOut, error = %e, "Refresh failed");
                            return Err(original);
                        }
                    },
                }
                phase = Phase::Retried;
                continue;
            }

            let attempt = request.clone().with_bearer(bearer.clone());
            let response = self.transport.execute(&attempt).await?;

            if response.status != 401 {
                debug!(path = %request.path, phase = %Phase::Done, status = response.status, "Request complete");
                return response.error_for_status();
            }

            let err = ApiError::from_status(response.status, &response.body);
            if phase == Phase::Retried {
                warn!(path = %request.path, "Retried request still unauthorized");
                return Err(err);
            }
            original_401 = Some(err);
            phase = Phase::Refreshing;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(encode(body)?)).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::new(Method::PUT, path).json(encode(body)?))
            .await?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::new(Method::DELETE, path)).await?;
        Ok(())
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::test_support::{gateway, login_body, token_for, ScriptedTransport};
    use serde_json::json;

    const COURSES: &str = "/api/courses";
    const REFRESH: &str = "/api/auth/refresh-token";
    const LOGOUT: &str = "/api/auth/logout";

    async fn client() -> (ApiClient, Arc<ScriptedTransport>, String) {
        let (gw, transport, _) = gateway();
        let token = token_for("u-1", json!({"n": 1}));
        transport.respond("/api/auth/login", 200, login_body(&token, "student", Some(true)));
        gw.login("ada@example.com", "pw", Role::Student).await.unwrap();
        (ApiClient::new(gw), transport, token)
    }

    #[tokio::test]
    async fn test_success_passes_through_with_bearer() {
        let (client, transport, token) = client().await;
        transport.respond(COURSES, 200, json!([{"id": "c1"}]));

        let courses: serde_json::Value = client.get_json(COURSES).await.unwrap();
        assert_eq!(courses[0]["id"], "c1");
        assert_eq!(transport.requests_to(COURSES)[0].bearer, Some(token));
        assert_eq!(transport.count(REFRESH), 0);
    }

    #[tokio::test]
    async fn test_single_401_refreshes_once_and_retries_once() {
        let (client, transport, old_token) = client().await;
        let new_token = token_for("u-1", json!({"n": 2}));
        transport.respond(COURSES, 401, json!({"detail": "Token expired"}));
        transport.respond(COURSES, 200, json!({"ok": true}));
        transport.respond(REFRESH, 200, json!({"access_token": new_token}));

        let body: serde_json::Value = client.get_json(COURSES).await.unwrap();
        assert_eq!(body["ok"], true);

        assert_eq!(transport.count(REFRESH), 1);
        let sent = transport.requests_to(COURSES);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].bearer, Some(old_token));
        assert_eq!(sent[1].bearer, Some(new_token.clone()));
        assert_eq!(client.gateway().store().token(), Some(new_token));
    }

    #[tokio::test]
    async fn test_retry_failure_is_propagated_unmodified() {
        let (client, transport, _) = client().await;
        transport.respond(COURSES, 401, json!({}));
        transport.respond(COURSES, 403, json!({"message": "teachers only"}));
        transport.respond(REFRESH, 200, json!({"access_token": token_for("u-1", json!({"n": 2}))}));

        let err = client.send(ApiRequest::get(COURSES)).await.unwrap_err();
        assert_eq!(err, ApiError::AccessDenied("teachers only".to_string()));
    }

    #[tokio::test]
    async fn test_retried_401_does_not_refresh_again() {
        let (client, transport, _) = client().await;
        transport.respond(COURSES, 401, json!({"detail": "first"}));
        transport.respond(COURSES, 401, json!({"detail": "second"}));
        transport.respond(REFRESH, 200, json!({"access_token": token_for("u-1", json!({"n": 2}))}));

        let err = client.send(ApiRequest::get(COURSES)).await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized("second".to_string()));
        assert_eq!(transport.count(REFRESH), 1);
        assert_eq!(transport.count(COURSES), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_logs_out_and_surfaces_original_401() {
        let (client, transport, _) = client().await;
        transport.respond(COURSES, 401, json!({"detail": "Token expired"}));
        transport.respond(REFRESH, 401, json!({"detail": "Refresh token required"}));
        transport.respond(LOGOUT, 200, json!({}));

        let err = client.send(ApiRequest::get(COURSES)).await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized("Token expired".to_string()));
        assert!(client.gateway().store().current().is_none());
        assert_eq!(transport.count(COURSES), 1);
    }

    #[tokio::test]
    async fn test_concurrent_401s_trigger_one_refresh() {
        let (client, transport, _) = client().await;
        let gate = transport.gate(REFRESH);
        let new_token = token_for("u-1", json!({"n": 2}));
        transport.respond(COURSES, 401, json!({}));
        transport.respond(COURSES, 401, json!({}));
        transport.respond(COURSES, 200, json!({"page": 1}));
        transport.respond(COURSES, 200, json!({"page": 2}));
        transport.respond(REFRESH, 200, json!({"access_token": new_token}));

        let release = async {
            while transport.count(REFRESH) == 0 {
                tokio::task::yield_now().await;
            }
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            gate.add_permits(1);
        };

        let (a, b, _) = tokio::join!(
            client.send(ApiRequest::get(COURSES)),
            client.send(ApiRequest::get(COURSES)),
            release
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(transport.count(REFRESH), 1);

        let retries: Vec<_> = transport.requests_to(COURSES).into_iter().skip(2).collect();
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|r| r.bearer.as_deref() == Some(new_token.as_str())));
    }

    #[tokio::test]
    async fn test_401_after_another_refresh_reuses_new_token() {
        let (client, transport, _) = client().await;
        let gate = transport.gate(COURSES);
        let new_token = token_for("u-1", json!({"n": 2}));
        transport.respond(COURSES, 401, json!({}));
        transport.respond(COURSES, 200, json!({}));
        transport.respond(REFRESH, 200, json!({"access_token": new_token}));

        // Refresh completes while the request is still waiting on its 401.
        let refresh_then_release = async {
            while transport.count(COURSES) == 0 {
                tokio::task::yield_now().await;
            }
            client.gateway().refresh().await.unwrap();
            gate.add_permits(2);
        };

        let (result, _) = tokio::join!(client.send(ApiRequest::get(COURSES)), refresh_then_release);
        assert!(result.is_ok());
        assert_eq!(transport.count(REFRESH), 1);
        assert_eq!(transport.requests_to(COURSES)[1].bearer, Some(new_token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_does_not_block_next_session() {
        let (client, transport, _) = client().await;
        let gate = transport.gate(REFRESH);
        transport.respond(REFRESH, 200, json!({"access_token": token_for("u-1", json!({"n": 2}))}));
        transport.respond(REFRESH, 200, json!({"access_token": token_for("u-2", json!({"n": 3}))}));

        // Caller gives up while the refresh is still waiting on the server
        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(20), client.gateway().refresh()).await;
        assert!(abandoned.is_err());
        assert_eq!(transport.count(REFRESH), 1);

        transport.respond(LOGOUT, 200, json!({}));
        client.gateway().logout().await;
        let token = token_for("u-2", json!({"n": 1}));
        transport.respond("/api/auth/login", 200, login_body(&token, "student", Some(true)));
        client.gateway().login("grace@example.com", "pw", Role::Student).await.unwrap();

        transport.respond(COURSES, 401, json!({"detail": "Token expired"}));
        transport.respond(COURSES, 200, json!({"ok": true}));
        gate.add_permits(2);

        let body: serde_json::Value = client.get_json(COURSES).await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(transport.count(REFRESH), 2);

        let sent = transport.requests_to(COURSES);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].bearer, Some(token));
        assert_eq!(sent[1].bearer, client.gateway().store().token());
        assert!(client.gateway().store().current().is_some());
    }

    #[tokio::test]
    async fn test_401_without_session_is_not_refreshed() {
        let (gw, transport, _) = gateway();
        let client = ApiClient::new(gw);
        transport.respond(COURSES, 401, json!({"detail": "Not authenticated"}));

        let err = client.send(ApiRequest::get(COURSES)).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(transport.count(REFRESH), 0);
        assert_eq!(transport.requests_to(COURSES)[0].bearer, None);
    }

    #[tokio::test]
    async fn test_post_and_delete_helpers() {
        let (client, transport, _) = client().await;
        transport.respond("/api/courses/c1/enroll", 201, json!({"enrolled": true}));
        transport.respond("/api/notifications/n1", 204, serde_json::Value::Null);

        let body: serde_json::Value = client
            .post_json("/api/courses/c1/enroll", &json!({"student": "u-1"}))
            .await
            .unwrap();
        assert_eq!(body["enrolled"], true);
        client.delete("/api/notifications/n1").await.unwrap();

        let sent = transport.requests_to("/api/notifications/n1");
        assert_eq!(sent[0].method, Method::DELETE);
    }
}
