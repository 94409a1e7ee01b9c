//! Market Data Client Binary
//!
//! Connects the push feed, seeds the configured watchlist over REST and logs
//! every reconciled update.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-client
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_DATA_API_KEY`: Provider API key
//!
//! ## Optional
//! - `MARKET_DATA_SYMBOLS`: Comma-separated watchlist (default: empty)
//! - `MARKET_DATA_FEED_URL`: Push feed URL
//! - `MARKET_DATA_REST_URL`: REST base URL
//! - `MARKET_DATA_TOKEN_URL`: Token endpoint (default: use the API key directly)
//! - `MARKET_DATA_RATE_LIMIT_PER_MINUTE`: REST quota (default: 5)
//! - `MARKET_DATA_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_data_client::application::ports::{PushFeedPort, SnapshotSource, TokenProvider};
use market_data_client::{
    CacheConfig, CacheStore, ClientConfig, ConnectGate, HealthServer, HealthServerState,
    HttpTokenProvider, MarketData, MarketDataClient, OrchestratorConfig, PushFeedTransport,
    RateLimitConfig, RateLimiter, ReconciliationStore, SnapshotClient, StaticTokenProvider,
    StoreConfig, StreamEvent, Subscription, SystemClock, TransportConfig, init_metrics,
    init_telemetry,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered feed events between transport and ingest.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = init_telemetry();

    tracing::info!("Starting market data client");

    let _metrics_handle = init_metrics();

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let clock = SystemClock::shared();

    // Local state
    let cache = Arc::new(CacheStore::new(
        CacheConfig::from_settings(&config.cache),
        Arc::clone(&clock),
    ));
    let store = Arc::new(
        ReconciliationStore::new(StoreConfig::from_settings(&config.store), Arc::clone(&clock))
            .with_cache(Arc::clone(&cache)),
    );
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::from_settings(&config.rate_limit),
        Arc::clone(&clock),
    ));

    // Upstream adapters
    let rest: Arc<dyn SnapshotSource> = Arc::new(SnapshotClient::from_config(&config)?);
    let tokens: Arc<dyn TokenProvider> = match &config.endpoints.token_url {
        Some(url) => Arc::new(HttpTokenProvider::new(
            url.clone(),
            config.api_key.clone(),
            config.endpoints.token_timeout,
        )?),
        None => Arc::new(StaticTokenProvider::new(config.api_key.clone())),
    };

    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
    let (transport, feed_handle) = PushFeedTransport::new(
        TransportConfig::from_config(&config),
        tokens,
        ConnectGate::new(),
        event_tx,
        shutdown_token.clone(),
    );
    let feed: Arc<dyn PushFeedPort> = Arc::new(feed_handle);

    let client = MarketDataClient::new(
        OrchestratorConfig::from_config(&config),
        Arc::clone(&store),
        cache,
        limiter,
        rest,
        Arc::clone(&feed),
    );

    let mut tasks = client.start(event_rx, &shutdown_token);

    tasks.push(tokio::spawn(async move {
        if let Err(e) = transport.run().await {
            tracing::error!(error = %e, "Push feed transport error");
        }
    }));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        feed,
        store,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let subscriptions = subscribe_watchlist(&client, &config.symbols);
    tracing::info!(symbols = subscriptions.len(), "Market data client ready");

    await_shutdown(shutdown_token).await;

    drop(subscriptions);
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Background tasks did not stop within the shutdown timeout");
    }

    tracing::info!("Market data client stopped");
    Ok(())
}

/// Subscribe a logging handler to every watchlist symbol.
fn subscribe_watchlist(client: &MarketDataClient, symbols: &[String]) -> Vec<Subscription> {
    symbols
        .iter()
        .filter_map(|symbol| {
            client
                .subscribe(symbol, log_update)
                .inspect_err(|e| tracing::warn!(symbol = %symbol, error = %e, "Skipping watchlist symbol"))
                .ok()
        })
        .collect()
}

fn log_update(data: &MarketData) {
    tracing::info!(
        symbol = %data.symbol,
        price = ?data.price,
        bid = ?data.bid,
        ask = ?data.ask,
        volume = ?data.volume,
        source = data.metadata.source.as_str(),
        reliability = data.metadata.reliability,
        "Market data update"
    );
}

/// Load .env from the working directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        symbols = config.symbols.len(),
        requests_per_minute = config.rate_limit.requests_per_minute,
        health_port = config.server.health_port,
        token_endpoint = config.endpoints.token_url.is_some(),
        "Configuration loaded"
    );
    tracing::debug!(
        feed_url = %config.endpoints.feed_url,
        rest_url = %config.endpoints.rest_url,
        "Upstream endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
