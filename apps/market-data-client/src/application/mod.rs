//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (token endpoint, REST, push feed).
pub mod ports;

/// Application services: rate limiting, caching, reconciliation, orchestration.
pub mod services;
