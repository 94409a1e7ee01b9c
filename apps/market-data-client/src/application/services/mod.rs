//! Application Services
//!
//! Services that coordinate domain logic and ports.
//!
//! - `RateLimiter`: Per-identity token buckets for the REST API
//! - `CacheStore`: TTL cache with tag invalidation
//! - `ReconciliationStore`: Authoritative per-symbol records and fan-out
//! - `MarketDataClient`: Subscribe/snapshot orchestration across sources

pub mod cache;
mod client_error;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reconciliation;

pub use cache::{CacheConfig, CacheEntry, CacheError, CacheNamespace, CacheStore};
pub use client_error::{ClientError, ErrorContext};
pub use orchestrator::{MarketDataClient, OrchestratorConfig, SeedOutcome, Subscription};
pub use rate_limiter::{RateDecision, RateLimitConfig, RateLimitError, RateLimiter};
pub use reconciliation::{EvictionReport, ReconciliationStore, StoreConfig};
