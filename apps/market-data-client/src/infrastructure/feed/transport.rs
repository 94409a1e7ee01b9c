//! Push Feed Transport
//!
//! Async driver for [`FeedSession`]: owns the WebSocket, applies
//! subscription commands, forwards decoded events over an mpsc channel and
//! reconnects with backoff.
//!
//! # Lifecycle
//!
//! 1. Wait for the shared [`ConnectGate`] so only one transport handshakes
//!    at a time.
//! 2. Fetch a token (bounded by `auth_timeout`), open the socket, send the
//!    auth frame.
//! 3. On `auth_success` release the gate and flush the backlog in batches.
//! 4. On close, error, auth failure or heartbeat silence, back off and
//!    retry. Once retries are exhausted the status becomes `offline` and the
//!    transport parks until [`FeedCommand::Reconnect`] or cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::auth::AuthError;
use super::batcher::BatchConfig;
use super::codec::{CodecError, FeedCodec, FeedItem};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatState};
use super::messages::{Channel, ClientAction, StatusKind, StatusMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{FeedSession, SessionError};
use crate::application::ports::{PushFeedPort, TokenProvider};
use crate::domain::market_data::Symbol;
use crate::domain::streaming::{ConnectionStatus, StreamEvent};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handshake failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Session state machine refused a transition.
    #[error("invalid session transition: {0}")]
    Session(#[from] SessionError),

    /// Nothing received within the heartbeat timeout.
    #[error("no inbound traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Event consumer went away.
    #[error("event receiver dropped")]
    EventChannelClosed,

    /// Connect gate was closed.
    #[error("connect gate closed")]
    GateClosed,

    /// Reconnect attempts exhausted.
    #[error("reconnect attempts exhausted after {0} retries")]
    MaxReconnectsExceeded(u32),
}

impl TransportError {
    /// Errors that end the transport instead of triggering a reconnect.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::EventChannelClosed | Self::GateClosed)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL.
    pub url: String,
    /// Bound on token fetch and on waiting for the auth verdict.
    pub auth_timeout: Duration,
    /// Channels subscribed per symbol.
    pub channels: Vec<Channel>,
    /// Backoff.
    pub reconnect: ReconnectConfig,
    /// Watchdog.
    pub heartbeat: HeartbeatConfig,
    /// Subscribe batching.
    pub batch: BatchConfig,
}

impl TransportConfig {
    /// Create configuration from the client configuration.
    #[must_use]
    pub fn from_config(config: &crate::ClientConfig) -> Self {
        Self {
            url: config.endpoints.feed_url.clone(),
            auth_timeout: config.websocket.auth_timeout,
            channels: config.websocket.channels.clone(),
            reconnect: ReconnectConfig::from_websocket_settings(&config.websocket),
            heartbeat: HeartbeatConfig::from_websocket_settings(&config.websocket),
            batch: BatchConfig::from_settings(&config.batching),
        }
    }
}

// =============================================================================
// Connect Gate
// =============================================================================

/// Serializes connection handshakes across transports.
///
/// Waiters are served in FIFO order. A transport holds the permit from the
/// start of its handshake until authentication succeeds or fails.
#[derive(Debug, Clone)]
pub struct ConnectGate {
    permits: Arc<Semaphore>,
}

impl Default for ConnectGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectGate {
    /// Create a gate admitting one handshake at a time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransportError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::GateClosed)
    }

    /// True when no handshake is in progress.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.permits.available_permits() > 0
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Command for the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    /// Add symbols to the desired set.
    Subscribe(Vec<Symbol>),
    /// Remove symbols from the desired set.
    Unsubscribe(Vec<Symbol>),
    /// Leave the offline state (or skip the current backoff wait).
    Reconnect,
}

/// Cloneable control handle for a running transport.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    status: watch::Receiver<ConnectionStatus>,
    attempts: Arc<AtomicU32>,
}

impl FeedHandle {
    fn send(&self, command: FeedCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Push feed transport stopped, command dropped");
        }
    }

    /// Current status.
    #[must_use]
    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }
}

impl PushFeedPort for FeedHandle {
    fn subscribe(&self, symbols: &[Symbol]) {
        if !symbols.is_empty() {
            self.send(FeedCommand::Subscribe(symbols.to_vec()));
        }
    }

    fn unsubscribe(&self, symbols: &[Symbol]) {
        if !symbols.is_empty() {
            self.send(FeedCommand::Unsubscribe(symbols.to_vec()));
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn reconnect(&self) {
        self.send(FeedCommand::Reconnect);
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Push feed connection driver.
pub struct PushFeedTransport {
    config: TransportConfig,
    tokens: Arc<dyn TokenProvider>,
    gate: ConnectGate,
    codec: FeedCodec,
    session: FeedSession,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    status: watch::Sender<ConnectionStatus>,
    attempts: Arc<AtomicU32>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl PushFeedTransport {
    /// Create a transport and its control handle.
    #[must_use]
    pub fn new(
        config: TransportConfig,
        tokens: Arc<dyn TokenProvider>,
        gate: ConnectGate,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> (Self, FeedHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let attempts = Arc::new(AtomicU32::new(0));

        let session = FeedSession::new(config.batch.clone(), config.channels.clone());
        let policy = ReconnectPolicy::new(config.reconnect.clone());

        let handle = FeedHandle {
            commands: command_tx,
            status: status_rx,
            attempts: Arc::clone(&attempts),
        };

        let transport = Self {
            config,
            tokens,
            gate,
            codec: FeedCodec::new(),
            session,
            policy,
            commands: command_rx,
            status: status_tx,
            attempts,
            events,
            cancel,
        };

        (transport, handle)
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MaxReconnectsExceeded`] if cancelled while
    /// offline, or a fatal error if the event consumer goes away.
    pub async fn run(mut self) -> Result<(), TransportError> {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let error = match self.connect_and_stream().await {
                Ok(()) => break,
                Err(e) => e,
            };

            self.session.on_disconnect();
            self.publish(ConnectionStatus::Disconnected);

            if error.is_fatal() {
                tracing::error!(error = %error, "Push feed transport stopping");
                return Err(error);
            }
            if let TransportError::Auth(auth) = &error {
                metrics::record_auth_failure(auth.reason());
                tracing::warn!(error = %auth, "Push feed authentication failed");
            } else {
                tracing::warn!(error = %error, "Push feed connection lost");
            }

            if let Some(delay) = self.policy.next_delay() {
                let attempt = self.policy.attempt_count();
                self.attempts.store(attempt, Ordering::Relaxed);
                metrics::record_reconnect();
                self.session.begin_reconnect();
                self.publish(ConnectionStatus::Connecting);

                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnecting to push feed"
                );

                if !self.wait_backoff(delay).await {
                    break;
                }
            } else {
                let attempts = self.policy.attempt_count();
                tracing::error!(attempts, "Push feed reconnect attempts exhausted, going offline");
                self.publish(ConnectionStatus::Offline);

                if !self.wait_offline().await {
                    return Err(TransportError::MaxReconnectsExceeded(attempts));
                }

                tracing::info!("Manual reconnect requested");
                self.policy.reset();
                self.attempts.store(0, Ordering::Relaxed);
            }
        }

        self.session.on_disconnect();
        self.publish(ConnectionStatus::Disconnected);
        tracing::info!("Push feed transport stopped");
        Ok(())
    }

    /// One connection from handshake to loss. `Ok` means stop.
    async fn connect_and_stream(&mut self) -> Result<(), TransportError> {
        self.session.begin_connect()?;
        self.publish(ConnectionStatus::Connecting);

        let permit = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            permit = self.gate.acquire() => permit?,
        };
        let mut permit = Some(permit);

        let token = self.fetch_token().await?;

        tracing::info!(url = %self.config.url, "Connecting to push feed");
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result?,
        };
        let (mut write, mut read) = ws_stream.split();

        let auth = self.session.on_open(&token)?;
        self.publish(ConnectionStatus::Connected);
        self.send(&mut write, &auth).await?;

        let opened = Instant::now();
        let auth_deadline = opened + self.config.auth_timeout;
        let mut heartbeat = HeartbeatState::new(self.config.heartbeat.clone(), opened);

        loop {
            let batch_due = self.session.next_deadline();
            let heartbeat_due = heartbeat.next_wakeup();
            let authenticated = self.session.is_authenticated();

            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = tokio::time::sleep_until(auth_deadline), if !authenticated => {
                    return Err(AuthError::Timeout(self.config.auth_timeout).into());
                }
                () = sleep_until_opt(batch_due) => {
                    if let Some(action) = self.session.poll(Instant::now()) {
                        self.send(&mut write, &action).await?;
                    }
                }
                () = tokio::time::sleep_until(heartbeat_due) => {
                    match heartbeat.poll(Instant::now()) {
                        Some(HeartbeatEvent::SendPing) => {
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            return Err(TransportError::HeartbeatTimeout(
                                heartbeat.idle_for(Instant::now()),
                            ));
                        }
                        None => {}
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(FeedCommand::Subscribe(symbols)) => {
                            self.session.request_subscribe(&symbols, Instant::now());
                        }
                        Some(FeedCommand::Unsubscribe(symbols)) => {
                            if let Some(action) = self.session.request_unsubscribe(&symbols) {
                                self.send(&mut write, &action).await?;
                            }
                        }
                        Some(FeedCommand::Reconnect) => {
                            tracing::debug!("Reconnect requested while connected, ignoring");
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                msg = read.next() => {
                    heartbeat.record_activity(Instant::now());
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text, &mut permit).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            return Err(TransportError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Push feed stream ended");
                            return Err(TransportError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    async fn fetch_token(&self) -> Result<String, TransportError> {
        let timeout = self.config.auth_timeout;
        match tokio::time::timeout(timeout, self.tokens.fetch_token()).await {
            Ok(result) => Ok(result.map_err(AuthError::from)?),
            Err(_) => Err(AuthError::Timeout(timeout).into()),
        }
    }

    async fn handle_text(
        &mut self,
        text: &str,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> Result<(), TransportError> {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_malformed_message(e.label());
                tracing::warn!(error = %e, "Dropping undecodable push frame");
                return Ok(());
            }
        };

        for rejected in &frame.rejected {
            metrics::record_malformed_message(rejected.label());
            tracing::warn!(error = %rejected, "Dropping malformed push item");
        }

        for item in frame.items {
            match item {
                FeedItem::Status(status) => self.handle_status(&status, permit)?,
                FeedItem::Event(event) => {
                    metrics::record_feed_message(event.kind());
                    if self.events.send(event).await.is_err() {
                        return Err(TransportError::EventChannelClosed);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_status(
        &mut self,
        status: &StatusMessage,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> Result<(), TransportError> {
        match status.kind() {
            StatusKind::AuthSuccess => {
                self.session.on_auth_success(Instant::now());
                self.policy.reset();
                self.attempts.store(0, Ordering::Relaxed);
                permit.take();
                self.publish(ConnectionStatus::Authenticated);
                tracing::info!(
                    backlog = self.session.backlog().len(),
                    "Push feed authenticated"
                );
            }
            StatusKind::AuthFailed => {
                return Err(AuthError::Rejected(status.message.clone()).into());
            }
            StatusKind::Error => {
                tracing::warn!(message = %status.message, "Push feed reported an error");
            }
            StatusKind::Connected | StatusKind::Success | StatusKind::Other => {
                tracing::debug!(status = %status.status, message = %status.message, "Push feed status");
            }
        }
        Ok(())
    }

    async fn send<W>(&self, write: &mut W, action: &ClientAction) -> Result<(), TransportError>
    where
        W: SinkExt<Message, Error = WsError> + Unpin,
    {
        let json = self.codec.encode(action)?;
        if action.symbols().is_empty() {
            tracing::debug!(action = action.action.as_str(), "Sending push frame");
        } else {
            metrics::record_subscribe_frame(action.action.as_str());
            tracing::debug!(
                action = action.action.as_str(),
                params = %action.params,
                "Sending push frame"
            );
        }
        write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Sleep out a backoff delay. `false` means stop.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    Some(FeedCommand::Reconnect) => return true,
                    Some(command) => self.apply_disconnected(command),
                    None => return false,
                },
            }
        }
    }

    /// Park in the offline state. `true` means a reconnect was requested.
    async fn wait_offline(&mut self) -> bool {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(FeedCommand::Reconnect) => return true,
                    Some(command) => self.apply_disconnected(command),
                    None => return false,
                },
            }
        }
    }

    fn apply_disconnected(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::Subscribe(symbols) => {
                self.session.request_subscribe(&symbols, Instant::now());
            }
            FeedCommand::Unsubscribe(symbols) => {
                let _ = self.session.request_unsubscribe(&symbols);
            }
            FeedCommand::Reconnect => {}
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            metrics::set_connection_status(status);
            if self.events.try_send(StreamEvent::Status(status)).is_err() {
                tracing::trace!(%status, "Status event not delivered");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockTokenProvider, TokenError};

    fn config(max_attempts: u32) -> TransportConfig {
        TransportConfig {
            url: "ws://127.0.0.1:9".to_string(),
            auth_timeout: Duration::from_secs(1),
            channels: Channel::ALL.to_vec(),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts,
            },
            heartbeat: HeartbeatConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn token_failures_exhaust_into_offline() {
        let mut tokens = MockTokenProvider::new();
        tokens
            .expect_fetch_token()
            .times(6)
            .returning(|| Err(TokenError::Unauthorized));

        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let (transport, handle) = PushFeedTransport::new(
            config(2),
            Arc::new(tokens),
            ConnectGate::new(),
            events_tx,
            cancel.clone(),
        );
        let task = tokio::spawn(transport.run());

        let mut status = handle.status();
        status
            .wait_for(|s| *s == ConnectionStatus::Offline)
            .await
            .unwrap();
        assert_eq!(handle.reconnect_attempts(), 2);

        status.borrow_and_update();
        handle.reconnect();
        status.changed().await.unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Offline)
            .await
            .unwrap();

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::MaxReconnectsExceeded(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_while_disconnected_join_the_backlog() {
        let mut tokens = MockTokenProvider::new();
        tokens
            .expect_fetch_token()
            .returning(|| Err(TokenError::Network("down".into())));

        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let (mut transport, handle) = PushFeedTransport::new(
            config(1),
            Arc::new(tokens),
            ConnectGate::new(),
            events_tx,
            cancel,
        );

        let aapl = Symbol::new("AAPL").unwrap();
        handle.subscribe(std::slice::from_ref(&aapl));
        handle.subscribe(&[]);

        let command = transport.commands.recv().await.unwrap();
        transport.apply_disconnected(command);
        assert_eq!(transport.session.backlog(), vec![aapl]);
        assert!(transport.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn gate_admits_one_handshake_at_a_time() {
        let gate = ConnectGate::new();
        let first = gate.acquire().await.unwrap();
        assert!(!gate.is_idle());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(drop) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
        assert!(gate.is_idle());
    }

    #[test]
    fn fatal_errors() {
        assert!(TransportError::EventChannelClosed.is_fatal());
        assert!(!TransportError::ConnectionClosed.is_fatal());
        assert!(!TransportError::Auth(AuthError::Rejected("x".into())).is_fatal());
    }
}
