//! Snapshot Source Port (Driven Port)
//!
//! Interface for the provider's batched REST snapshot endpoint. The adapter
//! validates each ticker independently; a malformed entry is counted in
//! [`SnapshotBatch::rejected`] instead of failing the whole batch.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::market_data::{MarketDataPatch, Symbol};

/// One validated ticker from a snapshot response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Ticker.
    pub symbol: Symbol,
    /// Fields reported for the ticker.
    pub patch: MarketDataPatch,
}

/// Result of one snapshot request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotBatch {
    /// Valid records.
    pub records: Vec<SnapshotRecord>,
    /// Entries dropped during validation.
    pub rejected: usize,
}

impl SnapshotBatch {
    /// Record for a symbol, if present.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| &r.symbol == symbol)
    }
}

/// Snapshot fetch failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    /// Upstream returned 429.
    #[error("upstream rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time the provider asked us to wait.
        retry_after: Duration,
    },

    /// Credentials rejected.
    #[error("snapshot request unauthorized")]
    Unauthorized,

    /// Transport failure or timeout.
    #[error("snapshot request failed: {0}")]
    Network(String),

    /// Non-success HTTP status.
    #[error("snapshot endpoint returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Body was not a snapshot response.
    #[error("invalid snapshot response: {0}")]
    Decode(String),
}

/// Batched REST snapshot endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch snapshots for a set of symbols in one request.
    async fn fetch_snapshots(&self, symbols: &[Symbol]) -> Result<SnapshotBatch, SnapshotError>;
}
