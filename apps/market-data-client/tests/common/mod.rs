//! Shared fixtures for integration tests.
//!
//! `FakeFeed` is a local WebSocket server speaking the provider's push
//! protocol: it acknowledges `auth`, records every client frame and can push
//! server frames to all open connections.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_data_client::{ClientConfig, Symbol};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// How the fake server answers `auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    /// `auth_success`
    Accept,
    /// `auth_failed`
    Reject,
}

/// Per-server behavior.
#[derive(Debug, Clone, Copy)]
pub struct FeedBehavior {
    /// Reply to `auth`.
    pub auth: AuthReply,
    /// Close the first connection right after its first subscribe frame.
    pub drop_first_after_subscribe: bool,
    /// Stop reading and writing once `auth` is accepted, leaving the socket
    /// open. Client pings go unanswered.
    pub silent_after_auth: bool,
}

impl Default for FeedBehavior {
    fn default() -> Self {
        Self {
            auth: AuthReply::Accept,
            drop_first_after_subscribe: false,
            silent_after_auth: false,
        }
    }
}

/// A client frame as seen by the server.
#[derive(Debug, Clone)]
pub struct Received {
    /// Zero-based connection index.
    pub connection: usize,
    /// `action` field.
    pub action: String,
    /// `params` field.
    pub params: String,
}

/// Local push feed server.
pub struct FakeFeed {
    /// `ws://` URL of the server.
    pub url: String,
    frames: mpsc::UnboundedReceiver<Received>,
    push: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
}

impl FakeFeed {
    /// Bind on an ephemeral port and start accepting.
    pub async fn start(behavior: FeedBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));

        let push_tx = push.clone();
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = counter.fetch_add(1, Ordering::SeqCst);
                let frame_tx = frame_tx.clone();
                let pushed = push_tx.subscribe();
                tokio::spawn(serve_connection(
                    stream, connection, behavior, frame_tx, pushed,
                ));
            }
        });

        Self {
            url,
            frames,
            push,
            connections,
        }
    }

    /// Next client frame.
    pub async fn next_frame(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("feed server stopped")
    }

    /// Next client frame with the given action.
    pub async fn next_action(&mut self, action: &str) -> Received {
        loop {
            let frame = self.next_frame().await;
            if frame.action == action {
                return frame;
            }
        }
    }

    /// Frames already received, without waiting.
    pub fn drain(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Send a raw frame to every open connection.
    pub fn push(&self, frame: &str) {
        let _ = self.push.send(frame.to_string());
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    connection: usize,
    behavior: FeedBehavior,
    frames: mpsc::UnboundedSender<Received>,
    mut pushed: broadcast::Receiver<String>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let connected = r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#;
    if write.send(Message::Text(connected.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = pushed.recv() => {
                let Ok(frame) = frame else { return };
                if write.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            msg = read.next() => {
                let Some(Ok(msg)) = msg else { return };
                let Message::Text(text) = msg else { continue };

                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let received = Received {
                    connection,
                    action: value["action"].as_str().unwrap_or_default().to_string(),
                    params: value["params"].as_str().unwrap_or_default().to_string(),
                };
                let action = received.action.clone();
                let _ = frames.send(received);

                match action.as_str() {
                    "auth" => {
                        let reply = match behavior.auth {
                            AuthReply::Accept => {
                                r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#
                            }
                            AuthReply::Reject => {
                                r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#
                            }
                        };
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }
                        if behavior.silent_after_auth && behavior.auth == AuthReply::Accept {
                            std::future::pending::<()>().await;
                        }
                    }
                    "subscribe" if behavior.drop_first_after_subscribe && connection == 0 => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Symbols in a `params` list like `AM.AAPL,T.AAPL,Q.AAPL`.
pub fn symbols_in(params: &str) -> Vec<String> {
    let mut symbols: Vec<String> = params
        .split(',')
        .filter_map(|entry| entry.split_once('.').map(|(_, s)| s.to_string()))
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Client configuration pointed at local servers with short timings.
pub fn test_config(feed_url: &str, rest_url: &str) -> ClientConfig {
    let mut config = ClientConfig::with_api_key("test-key");
    config.endpoints.feed_url = feed_url.to_string();
    config.endpoints.rest_url = rest_url.to_string();
    config.endpoints.rest_timeout = Duration::from_secs(2);
    config.websocket.auth_timeout = Duration::from_secs(2);
    config.websocket.reconnect_delay_initial = Duration::from_millis(20);
    config.websocket.reconnect_delay_max = Duration::from_millis(100);
    config.batching.batch_delay = Duration::from_millis(10);
    config.batching.debounce = Duration::from_millis(10);
    config.store.notify_debounce = Duration::from_millis(10);
    config
}

/// Parse a symbol in tests.
pub fn sym(s: &str) -> Symbol {
    Symbol::new(s).unwrap()
}
