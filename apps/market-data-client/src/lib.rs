#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Data Client - Real-Time Quote Multiplexer
//!
//! Keeps a bounded set of ticker symbols populated with fresh market data
//! from a rate-limited provider. A single push feed connection carries live
//! trades, quotes and aggregates; a batched REST snapshot endpoint seeds new
//! symbols and fills gaps. Every update is reconciled into one record per
//! symbol and fanned out to subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data records and rules
//!   - `market_data`: Per-symbol record, patches, reliability scoring
//!   - `streaming`: Typed feed events and connection status
//!   - `subscription`: Subscriber bookkeeping
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Token provider, snapshot source, push feed control
//!   - `services`: Rate limiter, cache, reconciliation store, orchestrator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: WebSocket push feed (session, transport, codec)
//!   - `rest`: REST snapshot client
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!  push feed ──► transport ──► mpsc<StreamEvent> ──┐
//!                                                  ├──► store ──► debounce ──► handlers
//!  REST snapshot ◄── rate limiter ◄── orchestrator ┘      │
//!                                                         └──► cache
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use domain::market_data::{DataSource, MarketData, MarketDataPatch, Symbol, SymbolError};
pub use domain::streaming::{ConnectionStatus, StreamEvent};

// Application services
pub use application::services::{
    CacheConfig, CacheStore, ClientError, MarketDataClient, OrchestratorConfig, RateLimitConfig,
    RateLimiter, ReconciliationStore, SeedOutcome, StoreConfig, Subscription,
};

// Infrastructure config
pub use infrastructure::config::{
    ApiKey, BatchSettings, CacheSettings, ClientConfig, ConfigError, EndpointSettings,
    RateLimitSettings, ServerSettings, StoreSettings, WebSocketSettings,
};

// Push feed (for integration tests)
pub use infrastructure::feed::{
    Channel, ConnectGate, FeedHandle, HttpTokenProvider, PushFeedTransport, StaticTokenProvider,
    TransportConfig, TransportError,
};

// REST snapshots
pub use infrastructure::rest::{RestError, SnapshotClient};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
