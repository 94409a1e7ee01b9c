//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TokenProvider`: Short-lived push-feed token issuance
//! - `SnapshotSource`: Batched REST snapshot endpoint
//! - `PushFeedPort`: Subscription control over the streaming connection

mod push_feed_port;
mod snapshot_source_port;
mod token_provider_port;

pub use push_feed_port::PushFeedPort;
pub use snapshot_source_port::{SnapshotBatch, SnapshotError, SnapshotRecord, SnapshotSource};
pub use token_provider_port::{TokenError, TokenProvider};

#[cfg(test)]
pub use push_feed_port::MockPushFeedPort;
#[cfg(test)]
pub use snapshot_source_port::MockSnapshotSource;
#[cfg(test)]
pub use token_provider_port::MockTokenProvider;
