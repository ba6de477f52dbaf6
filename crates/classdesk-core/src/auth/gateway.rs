//! Auth gateway: the only component that creates or destroys a session.
//!
//! Login, signup, logout, token refresh, password recovery and the
//! external-login round trip all go through here. Refreshes are coalesced:
//! while one is in flight every other caller awaits the same outcome.
//! A refresh runs as its own task, so it finishes and leaves the slot even
//! when every caller waiting on it has gone away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::pending::PendingAuth;
use super::session::{Session, SessionStore};
use super::token::{decode_token, Claims};
use super::AuthError;
use crate::api::cookies::PersistentCookieJar;
use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::models::{
    EmailRequest, LoginResponse, MessageResponse, OtpRequest, ResetPasswordRequest, Role,
    SignUpRequest, SignUpSummary, TokenResponse,
};

const SIGNUP_PATH: &str = "/api/auth/signup";
const LOGOUT_PATH: &str = "/api/auth/logout";
const REFRESH_PATH: &str = "/api/auth/refresh-token";
const FORGOT_PASSWORD_PATH: &str = "/api/auth/forgot-password";
const VERIFY_OTP_PATH: &str = "/api/auth/verify-otp";
const RESET_PASSWORD_PATH: &str = "/api/auth/reset-password";
const GOOGLE_LOGIN_PATH: &str = "/api/auth/google/login";
const GOOGLE_CALLBACK_PATH: &str = "/api/auth/google/callback";

/// Length of the one-time password mailed during password recovery.
const OTP_LENGTH: usize = 6;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// Where to send the user to start an external login.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalLogin {
    pub authorize_url: String,
    pub state: String,
}

/// The refresh currently running, tagged with the session generation it
/// was started for.
struct InFlightRefresh {
    id: u64,
    generation: u64,
    future: RefreshFuture,
}

struct GatewayInner {
    transport: Arc<dyn Transport>,
    store: SessionStore,
    cookies: Option<Arc<PersistentCookieJar>>,
    in_flight_refresh: Mutex<Option<InFlightRefresh>>,
    next_refresh_id: AtomicU64,
}

/// Cloneable handle; clones share the session store and refresh slot.
#[derive(Clone)]
pub struct AuthGateway {
    inner: Arc<GatewayInner>,
}

impl AuthGateway {
    pub fn new(transport: Arc<dyn Transport>, store: SessionStore) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                store,
                cookies: None,
                in_flight_refresh: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    /// Gateway whose logout also empties the cookie jar holding the
    /// refresh credential.
    pub fn with_cookie_jar(
        transport: Arc<dyn Transport>,
        store: SessionStore,
        cookies: Arc<PersistentCookieJar>,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                store,
                cookies: Some(cookies),
                in_flight_refresh: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Decode a token's claims. Failure is reported as `None`; callers treat
    /// it as an authentication failure.
    pub fn decode(token: &str) -> Option<Claims> {
        match decode_token(token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!(error = %e, "Failed to decode access token");
                None
            }
        }
    }

    pub async fn sign_up(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<SignUpSummary, AuthError> {
        if username.trim().is_empty() || email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::Validation(
                "Username, email and password are required".to_string(),
            ));
        }

        let body = SignUpRequest {
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
            role,
        };
        let request = ApiRequest::post(SIGNUP_PATH).json(to_json(&body)?);
        let response = self.submit(&request).await.map_err(AuthError::from_submission)?;

        info!(%role, "Account created");
        response.json::<Option<SignUpSummary>>()
            .map(Option::unwrap_or_default)
            .map_err(|e| AuthError::Server(e.to_string()))
    }

    /// Password login. Commits a session only for approved accounts.
    pub async fn login(&self, email: &str, password: &str, role: Role) -> Result<Session, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("Email and password are required".to_string()));
        }

        let request = ApiRequest::post(format!("{}/login", role.auth_base_path()))
            .form(&[("username", email), ("password", password)]);

        let response = self.submit(&request).await.map_err(|e| {
            warn!(error = %e, "Login rejected");
            AuthError::from_login(e)
        })?;

        let body: LoginResponse = response
            .json()
            .map_err(|e| AuthError::Server(format!("Unexpected login response: {}", e)))?;

        if !body.is_approved() {
            warn!(%role, "Login refused: account not approved");
            return Err(AuthError::NotApproved);
        }

        let session = session_from_login(body, role, email)?;
        self.inner.store.commit(session.clone());
        info!(role = %session.role, "Login successful");
        Ok(session)
    }

    /// Best-effort server logout followed by an unconditional local clear.
    pub async fn logout(&self) {
        self.inner.logout().await;
    }

    /// Exchange the refresh cookie for a new access token.
    ///
    /// Concurrent callers share a single in-flight request. A refresh
    /// started for an older session is never joined; a new one is started
    /// instead. On failure the session is logged out and the error returned.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let shared = {
            let mut slot = self.inner.lock_refresh();
            let generation = self.inner.store.generation();
            let joinable = slot
                .as_ref()
                .filter(|in_flight| in_flight.generation == generation)
                .map(|in_flight| in_flight.future.clone());

            match joinable {
                Some(future) => {
                    debug!("Joining in-flight token refresh");
                    future
                }
                None => {
                    if slot.is_some() {
                        debug!("In-flight refresh belongs to an older session, starting another");
                    }
                    let in_flight = GatewayInner::spawn_refresh(&self.inner, generation);
                    let future = in_flight.future.clone();
                    *slot = Some(in_flight);
                    future
                }
            }
        };

        shared.await
    }

    /// Ask the server to mail a one-time password to `email`.
    pub async fn request_password_reset(&self, email: &str) -> Result<String, AuthError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(AuthError::Validation("Please enter your email address".to_string()));
        }
        let body = to_json(&EmailRequest { email })?;
        self.submit_for_message(ApiRequest::post(FORGOT_PASSWORD_PATH).json(body), "OTP sent")
            .await
    }

    pub async fn verify_otp(&self, email: &str, otp: &str) -> Result<String, AuthError> {
        let otp = otp.trim();
        if otp.len() != OTP_LENGTH || !otp.chars().all(|c| c.is_ascii_digit()) {
            return Err(AuthError::Validation("Please enter the complete OTP".to_string()));
        }
        let body = to_json(&OtpRequest { email: email.trim(), otp })?;
        self.submit_for_message(ApiRequest::post(VERIFY_OTP_PATH).json(body), "OTP verified")
            .await
    }

    pub async fn reset_password(
        &self,
        email: &str,
        password: &str,
        confirm: &str,
    ) -> Result<String, AuthError> {
        if password.is_empty() {
            return Err(AuthError::Validation("Please enter your new password".to_string()));
        }
        if password != confirm {
            return Err(AuthError::Validation("Passwords do not match".to_string()));
        }
        let body = to_json(&ResetPasswordRequest { email: email.trim(), password })?;
        self.submit_for_message(
            ApiRequest::post(RESET_PASSWORD_PATH).json(body),
            "Password reset successful",
        )
        .await
    }

    /// Persist a pending-login marker and return the URL to send the user to.
    pub fn begin_external_login(&self, return_to: &str) -> Result<ExternalLogin, AuthError> {
        let pending = PendingAuth::new(return_to);
        pending
            .save(self.inner.store.storage().as_ref())
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        let path = format!("{}?state={}", GOOGLE_LOGIN_PATH, pending.state);
        info!("External login started");
        Ok(ExternalLogin {
            authorize_url: self.inner.transport.url_for(&path),
            state: pending.state,
        })
    }

    /// Finish an external login. The pending marker is consumed before
    /// anything else, so a callback can only be used once. Returns the
    /// session and the route the user asked to come back to.
    pub async fn resume_external_login(
        &self,
        state: &str,
        callback_query: &str,
    ) -> Result<(Session, String), AuthError> {
        let pending = PendingAuth::take(self.inner.store.storage().as_ref())
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or_else(|| AuthError::Validation("No external login in progress".to_string()))?;

        if pending.state != state {
            warn!("External login state mismatch");
            return Err(AuthError::Validation("External login state mismatch".to_string()));
        }
        if pending.is_expired() {
            return Err(AuthError::Validation("External login expired, please retry".to_string()));
        }

        let query = callback_query.trim_start_matches('?');
        let path = if query.is_empty() {
            GOOGLE_CALLBACK_PATH.to_string()
        } else {
            format!("{}?{}", GOOGLE_CALLBACK_PATH, query)
        };
        let response = self
            .submit(&ApiRequest::get(path))
            .await
            .map_err(AuthError::from_login)?;
        let body: LoginResponse = response
            .json()
            .map_err(|e| AuthError::Server(format!("Unexpected callback response: {}", e)))?;

        // Accounts created through the external provider are active on creation.
        let session = session_from_login(body, Role::Student, "")?;
        self.inner.store.commit(session.clone());
        info!(role = %session.role, "External login successful");
        Ok((session, pending.return_to))
    }

    async fn submit(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.inner
            .transport
            .execute(request)
            .await
            .and_then(ApiResponse::error_for_status)
    }

    async fn submit_for_message(
        &self,
        request: ApiRequest,
        fallback: &str,
    ) -> Result<String, AuthError> {
        let response = self.submit(&request).await.map_err(AuthError::from_submission)?;
        let body: Option<MessageResponse> = response.json().unwrap_or_default();
        Ok(body
            .and_then(|b| b.message)
            .unwrap_or_else(|| fallback.to_string()))
    }
}

impl GatewayInner {
    async fn logout(&self) {
        let current = self.store.current();
        let role = current.as_ref().map(|s| s.role).unwrap_or(Role::Student);
        let token = current.map(|s| s.token);

        let request = ApiRequest::post(LOGOUT_PATH).with_bearer(token);
        debug!(%role, "Notifying server of logout");
        match self
            .transport
            .execute(&request)
            .await
            .and_then(ApiResponse::error_for_status)
        {
            Ok(_) => debug!("Server session invalidated"),
            Err(e) => warn!(error = %e, "Server logout failed, clearing local session anyway"),
        }

        if let Some(ref cookies) = self.cookies {
            cookies.clear();
        }
        self.store.clear();
        info!("Logged out");
    }

    fn spawn_refresh(inner: &Arc<Self>, generation: u64) -> InFlightRefresh {
        let id = inner.next_refresh_id.fetch_add(1, Ordering::SeqCst);
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let result = Arc::clone(&task_inner).run_refresh(generation).await;
            task_inner.finish_refresh(id);
            result
        });

        let future = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(AuthError::Server(format!("Token refresh task failed: {}", e))))
        }
        .boxed()
        .shared();

        InFlightRefresh {
            id,
            generation,
            future,
        }
    }

    /// Empty the refresh slot if it still holds refresh `id`.
    fn finish_refresh(&self, id: u64) {
        let mut slot = self.lock_refresh();
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
    }

    async fn run_refresh(self: Arc<Self>, generation: u64) -> Result<Session, AuthError> {
        let previous = self.store.current();
        info!("Refreshing access token");

        let outcome = match self
            .transport
            .execute(&ApiRequest::post(REFRESH_PATH))
            .await
            .and_then(ApiResponse::error_for_status)
        {
            Ok(response) => response
                .json::<TokenResponse>()
                .map_err(|e| AuthError::SessionExpired(e.to_string()))
                .and_then(|body| session_from_refresh(body.access_token, previous.as_ref())),
            Err(e) => Err(AuthError::from_refresh(e)),
        };

        match outcome {
            Ok(session) => {
                if self.store.commit_if_current(generation, session.clone()) {
                    info!("Access token refreshed");
                    Ok(session)
                } else {
                    warn!("Session changed during refresh, discarding refreshed token");
                    Err(AuthError::SessionExpired("session changed while refreshing".to_string()))
                }
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                // A newer login or logout already decided the session.
                if self.store.generation() == generation {
                    self.logout().await;
                }
                Err(e)
            }
        }
    }

    fn lock_refresh(&self) -> MutexGuard<'_, Option<InFlightRefresh>> {
        self.in_flight_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_json<T: serde::Serialize>(body: &T) -> Result<serde_json::Value, AuthError> {
    serde_json::to_value(body).map_err(|e| AuthError::Validation(e.to_string()))
}

fn session_from_login(
    body: LoginResponse,
    requested: Role,
    email: &str,
) -> Result<Session, AuthError> {
    let role = body.account_role().unwrap_or(requested);
    if role != requested {
        debug!(%requested, actual = %role, "Account role differs from requested role");
    }

    let display_name = body
        .user
        .username
        .clone()
        .or_else(|| body.user.email.clone())
        .unwrap_or_else(|| email.to_string());

    Session::from_token(body.access_token, role, display_name)
}

/// Refresh responses carry only a token; role and display name come from
/// the session being refreshed, or from the token when there is none.
fn session_from_refresh(token: String, previous: Option<&Session>) -> Result<Session, AuthError> {
    let claims = decode_token(&token)?;

    let (role, display_name) = match previous {
        Some(previous) => (previous.role, previous.display_name.clone()),
        None => {
            let role = claims
                .get_str("role")
                .and_then(|r| r.parse::<Role>().ok())
                .ok_or_else(|| AuthError::SessionExpired("no session to refresh".to_string()))?;
            let name = claims
                .get_str("username")
                .or_else(|| claims.subject())
                .unwrap_or_default()
                .to_string();
            (role, name)
        }
    };

    Ok(Session {
        token,
        claims,
        role,
        display_name,
    })
}
