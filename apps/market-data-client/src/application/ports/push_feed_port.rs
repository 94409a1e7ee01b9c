//! Push Feed Port (Driven Port)
//!
//! Subscription control over the streaming connection. Calls are
//! non-blocking: the adapter queues them and applies them on its own task,
//! holding symbols in a backlog whenever the connection is not
//! authenticated.

use tokio::sync::watch;

use crate::domain::market_data::Symbol;
use crate::domain::streaming::ConnectionStatus;

/// Subscription control for the push feed.
#[cfg_attr(test, mockall::automock)]
pub trait PushFeedPort: Send + Sync {
    /// Request push updates for symbols.
    fn subscribe(&self, symbols: &[Symbol]);

    /// Stop push updates for symbols.
    fn unsubscribe(&self, symbols: &[Symbol]);

    /// Connection status channel.
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Reconnect attempts since the last successful authentication.
    fn reconnect_attempts(&self) -> u32;

    /// Leave the terminal offline state and start connecting again.
    fn reconnect(&self);
}
