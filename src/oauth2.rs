//! OAuth2 refresh-token grant and XOAUTH2 SASL support
//!
//! Providers are configured with their token endpoint, so the same client
//! serves Google, Microsoft and any RFC 6749 compliant server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AuthError;

/// Tokens returned by the token endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuth2Tokens {
    pub access_token: String,
    /// Present when the server rotates refresh tokens
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for OAuth2Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Tokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Inputs of one refresh_token grant
pub struct RefreshRequest<'a> {
    pub token_url: &'a str,
    pub client_id: &'a str,
    pub client_secret: Option<&'a str>,
    pub refresh_token: &'a str,
    pub scopes: Option<&'a str>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, request: RefreshRequest<'_>) -> Result<OAuth2Tokens, AuthError>;
}

/// Error response from the token endpoint (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Errors that mean the grant itself is dead, not that the server is unwell.
const TERMINAL_GRANT_ERRORS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "unsupported_grant_type",
    "invalid_scope",
];

/// HTTP client for the refresh_token grant
pub struct OAuth2Client {
    http_client: reqwest::Client,
}

impl OAuth2Client {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl TokenRefresher for OAuth2Client {
    async fn refresh(&self, request: RefreshRequest<'_>) -> Result<OAuth2Tokens, AuthError> {
        let mut params = vec![
            ("client_id", request.client_id),
            ("refresh_token", request.refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = request.client_secret {
            params.push(("client_secret", secret));
        }
        if let Some(scopes) = request.scopes {
            params.push(("scope", scopes));
        }

        let response = self
            .http_client
            .post(request.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("token request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AuthError::Unavailable(format!("unreadable token response: {}", e)));
        }

        let error: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
            error: "unknown_error".to_string(),
            error_description: None,
        });
        Err(classify_refresh_error(status.as_u16(), &error))
    }
}

fn classify_refresh_error(status: u16, error: &ErrorResponse) -> AuthError {
    let detail = match &error.error_description {
        Some(desc) => format!("{} ({})", error.error, desc),
        None => error.error.clone(),
    };
    if TERMINAL_GRANT_ERRORS.contains(&error.error.as_str()) || status == 401 {
        AuthError::Revoked(detail)
    } else if status >= 500 || status == 429 {
        AuthError::Unavailable(format!("status {}: {}", status, detail))
    } else {
        AuthError::Revoked(format!("status {}: {}", status, detail))
    }
}

/// XOAUTH2 initial client response, before base64.
///
/// Format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
pub fn xoauth2_payload(user: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", user, access_token)
}
