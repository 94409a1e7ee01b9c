//! Feed Authentication
//!
//! Token sources for the push feed handshake and the error type for a failed
//! handshake.
//!
//! - [`StaticTokenProvider`] hands out the configured API key unchanged.
//! - [`HttpTokenProvider`] exchanges the API key for a short-lived token at
//!   `POST {token_url}` (`{"token": "..."}`).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::application::ports::{TokenError, TokenProvider};
use crate::infrastructure::config::ApiKey;
use crate::infrastructure::rest::RestError;

/// Handshake failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Server answered `auth_failed`.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// No verdict within the auth timeout.
    #[error("authentication timed out after {0:?}")]
    Timeout(Duration),

    /// Token could not be obtained.
    #[error("token unavailable: {0}")]
    Token(#[from] TokenError),
}

impl AuthError {
    /// Metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
            Self::Token(_) => "token",
        }
    }
}

// =============================================================================
// Static token
// =============================================================================

/// Uses the API key itself as the feed token.
pub struct StaticTokenProvider {
    key: ApiKey,
}

impl StaticTokenProvider {
    /// Create a provider for a fixed key.
    #[must_use]
    pub const fn new(key: ApiKey) -> Self {
        Self { key }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        Ok(self.key.expose().to_string())
    }
}

// =============================================================================
// Token endpoint
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches a short-lived token over HTTP.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: String,
    key: ApiKey,
}

impl HttpTokenProvider {
    /// Create a provider for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, key: ApiKey, timeout: Duration) -> Result<Self, RestError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            key,
        })
    }
}

impl fmt::Debug for HttpTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTokenProvider")
            .field("url", &self.url)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.key.expose())
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TokenError::Unauthorized);
        }
        if !status.is_success() {
            return Err(TokenError::Network(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;
        if body.token.trim().is_empty() {
            return Err(TokenError::InvalidResponse("empty token".to_string()));
        }

        tracing::debug!(url = %self.url, "Fetched push feed token");
        Ok(body.token)
    }
}
