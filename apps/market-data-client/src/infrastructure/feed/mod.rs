//! Push Feed Adapter
//!
//! WebSocket client for the provider's stock stream:
//!
//! - **messages**: wire frames and channel prefixes (`AM`, `T`, `Q`)
//! - **codec**: per-item validated decoding into [`crate::domain::streaming::StreamEvent`]
//! - **session**: pure connection/subscription state machine
//! - **transport**: async driver with reconnect, heartbeat and connect gate

pub mod auth;
pub mod batcher;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use auth::{AuthError, HttpTokenProvider, StaticTokenProvider};
pub use batcher::{BatchConfig, SubscriptionBatcher};
pub use codec::{CodecError, DecodedFrame, FeedCodec, FeedItem};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatState};
pub use messages::{Action, Channel, ClientAction, ServerMessage, StatusKind, StatusMessage};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{ConnectionState, FeedSession, SessionError};
pub use transport::{
    ConnectGate, FeedCommand, FeedHandle, PushFeedTransport, TransportConfig, TransportError,
};
