//! Token Provider Port (Driven Port)
//!
//! Interface for obtaining the short-lived token used to authenticate the
//! push-feed connection. Issuance itself is out of scope; the feed only
//! needs an opaque string.

use async_trait::async_trait;

/// Token fetch failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    /// Token endpoint rejected our credentials.
    #[error("token endpoint rejected credentials")]
    Unauthorized,

    /// Token endpoint unreachable or timed out.
    #[error("token request failed: {0}")]
    Network(String),

    /// Response did not contain a usable token.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Source of push-feed authentication tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a token for a new connection attempt.
    async fn fetch_token(&self) -> Result<String, TokenError>;
}
