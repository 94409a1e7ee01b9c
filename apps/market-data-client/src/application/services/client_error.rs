//! Client Errors
//!
//! Errors surfaced to presentation code. Every upstream-facing variant
//! carries an [`ErrorContext`] naming the symbol, the source that failed and
//! when.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::rate_limiter::RateLimitError;
use crate::application::ports::SnapshotError;
use crate::domain::market_data::{DataSource, Symbol, SymbolError, ValidationError};

/// Where and when an error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Symbol involved, if the failure was symbol specific.
    pub symbol: Option<Symbol>,
    /// Data source that failed.
    pub source: DataSource,
    /// Wall-clock time of the failure.
    pub at: DateTime<Utc>,
}

impl ErrorContext {
    /// Context stamped with the current time.
    #[must_use]
    pub fn new(symbol: Option<&Symbol>, source: DataSource) -> Self {
        Self {
            symbol: symbol.cloned(),
            source,
            at: Utc::now(),
        }
    }
}

/// Public client error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Ticker failed validation.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),

    /// Local quota exhausted or upstream returned 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time until a retry could succeed.
        retry_after: Duration,
        /// Failure context.
        context: ErrorContext,
    },

    /// Upstream rejected our credentials.
    #[error("upstream rejected credentials")]
    Unauthorized {
        /// Failure context.
        context: ErrorContext,
    },

    /// Network failure or unusable upstream response.
    #[error("upstream request failed: {message}")]
    Upstream {
        /// Error description.
        message: String,
        /// Failure context.
        context: ErrorContext,
    },

    /// Data rejected before reaching the store.
    #[error("invalid market data: {0}")]
    Validation(#[from] ValidationError),
}

impl ClientError {
    /// Local rate limit denial.
    #[must_use]
    pub fn rate_limited(error: RateLimitError, symbol: Option<&Symbol>) -> Self {
        Self::RateLimited {
            retry_after: error.retry_after(),
            context: ErrorContext::new(symbol, DataSource::Rest),
        }
    }

    /// Map a snapshot fetch failure.
    #[must_use]
    pub fn from_snapshot(error: SnapshotError, symbol: Option<&Symbol>) -> Self {
        let context = ErrorContext::new(symbol, DataSource::Rest);
        match error {
            SnapshotError::RateLimited { retry_after } => Self::RateLimited {
                retry_after,
                context,
            },
            SnapshotError::Unauthorized => Self::Unauthorized { context },
            other => Self::Upstream {
                message: other.to_string(),
                context,
            },
        }
    }

    /// Suggested wait for rate-limit errors.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Failure context, if any.
    #[must_use]
    pub const fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Unauthorized { context }
            | Self::Upstream { context, .. } => Some(context),
            Self::InvalidSymbol(_) | Self::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_429_keeps_retry_after() {
        let symbol = Symbol::new("AAPL").unwrap();
        let error = ClientError::from_snapshot(
            SnapshotError::RateLimited {
                retry_after: Duration::from_secs(12),
            },
            Some(&symbol),
        );

        assert_eq!(error.retry_after(), Some(Duration::from_secs(12)));
        let context = error.context().unwrap();
        assert_eq!(context.symbol.as_ref(), Some(&symbol));
        assert_eq!(context.source, DataSource::Rest);
    }

    #[test]
    fn network_errors_become_upstream() {
        let error = ClientError::from_snapshot(SnapshotError::Network("reset".into()), None);
        assert!(matches!(error, ClientError::Upstream { ref message, .. } if message.contains("reset")));
        assert_eq!(error.retry_after(), None);
    }
}
