//! Bearer token payload decoding.
//!
//! The client never verifies signatures; claims are only used for display
//! and for carrying identity into the session. The server stays the
//! authority on validity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Decoded identity payload of an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().map(|at| Utc::now() >= at).unwrap_or(false)
    }

    /// Look up an arbitrary string claim such as `role` or `username`.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(|v| v.as_str())
    }
}

/// Decode the claims segment of a `header.payload.signature` token.
pub fn decode_token(token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::TokenDecode("expected three dot-separated segments".to_string()));
    };

    // Some issuers pad the payload; the URL-safe alphabet never includes '='.
    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::TokenDecode(format!("invalid base64 payload: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::TokenDecode(format!("invalid claims JSON: {}", e)))
}

#[cfg(test)]
pub(crate) fn make_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
