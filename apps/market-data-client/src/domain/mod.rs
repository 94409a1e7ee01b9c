//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the per-symbol market data record, reliability
//! scoring, streaming event types, and subscriber bookkeeping. Nothing here
//! performs I/O; time is read through the [`clock::Clock`] abstraction.

/// Injectable time source.
pub mod clock;

/// Per-symbol market data record, patches and reliability policy.
pub mod market_data;

/// Typed streaming events (trades, quotes, aggregates, status).
pub mod streaming;

/// Subscriber tracking per symbol.
pub mod subscription;
