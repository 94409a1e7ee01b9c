//! Feed Session
//!
//! Pure connection state machine for the push feed. The transport feeds it
//! socket events and instants; the session decides which frames to send.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticating -> Authenticated
//!       ^                                                          |
//!       +------------------ Reconnecting <------- (close/error) ---+
//! ```
//!
//! The session owns two symbol sets:
//!
//! - **desired**: every symbol someone asked for
//! - **live**: symbols a subscribe frame was sent for on this connection
//!
//! On authentication the backlog (`desired - live`) goes through the
//! batcher. On disconnect `live` is cleared, so after the next
//! authentication exactly the desired set is subscribed again.

use std::collections::BTreeSet;

use tokio::time::Instant;

use super::batcher::{BatchConfig, SubscriptionBatcher};
use super::messages::{Channel, ClientAction};
use crate::domain::market_data::Symbol;
use crate::domain::streaming::ConnectionStatus;

/// Transport-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Token fetch and socket handshake.
    Connecting,
    /// Socket open.
    Connected,
    /// Auth frame sent, awaiting the verdict.
    Authenticating,
    /// Subscriptions are live.
    Authenticated,
    /// Waiting out a backoff delay.
    Reconnecting,
}

impl ConnectionState {
    /// Status exposed to presentation code.
    #[must_use]
    pub const fn status(self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting | Self::Reconnecting => ConnectionStatus::Connecting,
            Self::Connected | Self::Authenticating => ConnectionStatus::Connected,
            Self::Authenticated => ConnectionStatus::Authenticated,
        }
    }
}

/// Invalid state transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot {action} while {from:?}")]
pub struct SessionError {
    /// State at the time of the call.
    pub from: ConnectionState,
    /// Attempted transition.
    pub action: &'static str,
}

/// Push feed session state.
#[derive(Debug)]
pub struct FeedSession {
    state: ConnectionState,
    channels: Vec<Channel>,
    desired: BTreeSet<Symbol>,
    live: BTreeSet<Symbol>,
    batcher: SubscriptionBatcher,
}

impl FeedSession {
    /// Create a disconnected session.
    #[must_use]
    pub fn new(batch: BatchConfig, channels: Vec<Channel>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            channels,
            desired: BTreeSet::new(),
            live: BTreeSet::new(),
            batcher: SubscriptionBatcher::new(batch),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once authentication succeeded on the current connection.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Start a connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] unless the session is disconnected or
    /// waiting to reconnect.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            from => Err(SessionError {
                from,
                action: "connect",
            }),
        }
    }

    /// Socket opened; returns the auth frame to send.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if no connection attempt is in progress.
    pub fn on_open(&mut self, token: &str) -> Result<ClientAction, SessionError> {
        if self.state != ConnectionState::Connecting {
            return Err(SessionError {
                from: self.state,
                action: "open",
            });
        }
        self.state = ConnectionState::Authenticating;
        Ok(ClientAction::auth(token))
    }

    /// Server accepted the token. Queues the backlog for subscription.
    pub fn on_auth_success(&mut self, now: Instant) {
        self.state = ConnectionState::Authenticated;
        let backlog = self.backlog();
        self.batcher.enqueue(&backlog, now);
    }

    /// Connection closed, failed or was rejected.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.live.clear();
        self.batcher.clear();
    }

    /// Enter the backoff wait.
    pub fn begin_reconnect(&mut self) {
        self.state = ConnectionState::Reconnecting;
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Add symbols to the desired set.
    ///
    /// When authenticated the new symbols are queued for the next batch;
    /// otherwise they join the backlog flushed after authentication.
    pub fn request_subscribe(&mut self, symbols: &[Symbol], now: Instant) {
        let mut added = Vec::new();
        for symbol in symbols {
            if self.desired.insert(symbol.clone()) && !self.live.contains(symbol) {
                added.push(symbol.clone());
            }
        }
        if self.is_authenticated() && !added.is_empty() {
            self.batcher.enqueue(&added, now);
        }
    }

    /// Remove symbols from the desired set.
    ///
    /// Returns an unsubscribe frame for symbols that were live; it is sent
    /// immediately, not batched.
    pub fn request_unsubscribe(&mut self, symbols: &[Symbol]) -> Option<ClientAction> {
        let mut dropped = Vec::new();
        for symbol in symbols {
            self.desired.remove(symbol);
            self.batcher.remove(symbol);
            if self.live.remove(symbol) {
                dropped.push(symbol.clone());
            }
        }
        if dropped.is_empty() || !self.is_authenticated() {
            return None;
        }
        Some(ClientAction::unsubscribe(&dropped, &self.channels))
    }

    /// Next subscribe frame, if a batch is due.
    pub fn poll(&mut self, now: Instant) -> Option<ClientAction> {
        if !self.is_authenticated() {
            return None;
        }
        loop {
            let batch = self.batcher.poll(now)?;
            let fresh: Vec<Symbol> = batch
                .into_iter()
                .filter(|s| self.desired.contains(s) && !self.live.contains(s))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            self.live.extend(fresh.iter().cloned());
            return Some(ClientAction::subscribe(&fresh, &self.channels));
        }
    }

    /// When [`Self::poll`] should next be called.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Authenticated => self.batcher.next_deadline(),
            _ => None,
        }
    }

    /// Desired symbols not yet live.
    #[must_use]
    pub fn backlog(&self) -> Vec<Symbol> {
        self.desired.difference(&self.live).cloned().collect()
    }

    /// Every symbol someone asked for.
    #[must_use]
    pub const fn desired(&self) -> &BTreeSet<Symbol> {
        &self.desired
    }

    /// Symbols subscribed on the current connection.
    #[must_use]
    pub const fn live(&self) -> &BTreeSet<Symbol> {
        &self.live
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::feed::messages::Action;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn session() -> FeedSession {
        FeedSession::new(BatchConfig::default(), Channel::ALL.to_vec())
    }

    fn authenticate(session: &mut FeedSession, now: Instant) {
        session.begin_connect().unwrap();
        session.on_open("tok").unwrap();
        session.on_auth_success(now);
    }

    fn after_debounce(now: Instant) -> Instant {
        now + Duration::from_millis(50)
    }

    #[test]
    fn connect_only_from_idle_states() {
        let mut s = session();
        s.begin_connect().unwrap();
        let err = s.begin_connect().unwrap_err();
        assert_eq!(err.from, ConnectionState::Connecting);

        s.on_disconnect();
        s.begin_reconnect();
        assert!(s.begin_connect().is_ok());
    }

    #[test]
    fn open_sends_auth_frame() {
        let mut s = session();
        assert!(s.on_open("tok").is_err());
        s.begin_connect().unwrap();
        let frame = s.on_open("tok").unwrap();
        assert_eq!(frame, ClientAction::auth("tok"));
        assert_eq!(s.state().status(), ConnectionStatus::Connected);
    }

    #[test]
    fn subscriptions_before_auth_flush_after_auth() {
        let now = Instant::now();
        let mut s = session();
        s.request_subscribe(&[sym("AAPL")], now);
        assert!(s.poll(after_debounce(now)).is_none());

        authenticate(&mut s, now);
        let frame = s.poll(after_debounce(now)).unwrap();
        assert_eq!(frame.action, Action::Subscribe);
        assert_eq!(frame.params, "AM.AAPL,T.AAPL,Q.AAPL");
        assert!(s.poll(after_debounce(now)).is_none());
    }

    #[test]
    fn reconnect_resubscribes_exactly_the_desired_set() {
        let now = Instant::now();
        let mut s = session();
        authenticate(&mut s, now);
        s.request_subscribe(&[sym("A"), sym("B"), sym("C")], now);
        let _ = s.poll(after_debounce(now));
        let _ = s.request_unsubscribe(&[sym("C")]);

        s.on_disconnect();
        assert!(s.live().is_empty());
        assert_eq!(s.backlog(), vec![sym("A"), sym("B")]);

        s.begin_reconnect();
        authenticate(&mut s, now);
        let frame = s.poll(after_debounce(now)).unwrap();
        assert_eq!(frame.symbols(), vec!["A", "B"]);
        assert_eq!(s.live().len(), 2);
    }

    #[test]
    fn no_duplicate_subscribe_for_live_symbol() {
        let now = Instant::now();
        let mut s = session();
        authenticate(&mut s, now);
        s.request_subscribe(&[sym("AAPL")], now);
        let _ = s.poll(after_debounce(now)).unwrap();

        s.request_subscribe(&[sym("AAPL")], now);
        assert!(s.next_deadline().is_none());
        assert!(s.poll(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn unsubscribe_is_immediate_and_cancels_pending() {
        let now = Instant::now();
        let mut s = session();
        authenticate(&mut s, now);
        s.request_subscribe(&[sym("AAPL"), sym("MSFT")], now);
        let _ = s.poll(after_debounce(now));

        s.request_subscribe(&[sym("TSLA")], now);
        assert!(s.request_unsubscribe(&[sym("TSLA")]).is_none());

        let frame = s.request_unsubscribe(&[sym("MSFT")]).unwrap();
        assert_eq!(frame.action, Action::Unsubscribe);
        assert_eq!(frame.params, "AM.MSFT,T.MSFT,Q.MSFT");
        assert!(s.poll(now + Duration::from_secs(1)).is_none());
        assert_eq!(s.desired().len(), 1);
    }

    #[test]
    fn large_backlog_respects_batch_size() {
        let now = Instant::now();
        let mut s = session();
        let symbols: Vec<Symbol> = (0..45).map(|i| sym(&format!("S{i:02}"))).collect();
        s.request_subscribe(&symbols, now);
        authenticate(&mut s, now);

        let t0 = after_debounce(now);
        assert_eq!(s.poll(t0).unwrap().symbols().len(), 20);
        assert!(s.poll(t0).is_none());
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_millis(100)));
    }
}
