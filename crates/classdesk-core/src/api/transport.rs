//! Raw request/response plumbing between the client and the backend.
//!
//! [`Transport`] is the seam the response interceptor and the auth gateway
//! talk through. [`HttpTransport`] is the reqwest-backed implementation;
//! tests substitute a scripted one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::cookies::PersistentCookieJar;
use super::ApiError;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// A replayable description of one backend call. The interceptor resends
/// the same value with a fresh bearer token after a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, including any query string.
    pub path: String,
    pub body: RequestBody,
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into its typed error.
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        // Empty 2xx bodies decode as JSON null
        let body = if self.body.trim().is_empty() { "null" } else { self.body.as_str() };
        serde_json::from_str(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Non-2xx statuses are returned as responses, not
    /// errors; only failure to get any response is an `Err`.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError>;

    /// Absolute URL for a path, used when the user must be sent elsewhere
    /// (external login).
    fn url_for(&self, path: &str) -> String;
}

/// Transport over a pooled reqwest client. Clone is cheap.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    initial_backoff: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, cookies: Arc<PersistentCookieJar>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_provider(cookies)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff; later ones keep doubling.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let url = self.url_for(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");

        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }

        match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(ref value) => builder.json(value),
            RequestBody::Form(ref fields) => builder.form(fields),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retries = 0;

        loop {
            let response = self.build(request).send().await?;
            let status = response.status().as_u16();

            if status == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                let delay = backoff_delay(self.initial_backoff, retries);
                warn!(path = %request.path, retry = retries, backoff_ms = delay.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await?;
            debug!(method = %request.method, path = %request.path, status, "Response received");
            return Ok(ApiResponse { status, body });
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Exponential backoff: `initial` before the first retry, doubling after.
fn backoff_delay(initial: Duration, retry: u32) -> Duration {
    initial.saturating_mul(1 << retry.saturating_sub(1).min(16))
}
