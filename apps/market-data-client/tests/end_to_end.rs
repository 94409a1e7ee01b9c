//! End-to-End Integration Tests
//!
//! Wires the client exactly like the binary does, against a local push feed
//! and a mocked REST snapshot endpoint.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use market_data_client::application::ports::PushFeedPort;
use market_data_client::{
    ApiKey, CacheConfig, CacheStore, ClientConfig, ClientError, ConnectGate, ConnectionStatus,
    DataSource, MarketData, MarketDataClient, OrchestratorConfig, PushFeedTransport,
    RateLimitConfig, RateLimiter, ReconciliationStore, SeedOutcome, SnapshotClient,
    StaticTokenProvider, StoreConfig, SystemClock, TransportConfig,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{FakeFeed, FeedBehavior, WAIT, test_config};

const SNAPSHOT_PATH: &str = "/v2/snapshot/locale/us/markets/stocks/tickers";

struct Harness {
    client: MarketDataClient,
    feed: FakeFeed,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start(rest: &MockServer, tweak: impl FnOnce(&mut ClientConfig)) -> Harness {
    let feed = FakeFeed::start(FeedBehavior::default()).await;
    let mut config = test_config(&feed.url, &rest.uri());
    tweak(&mut config);

    let cancel = CancellationToken::new();
    let clock = SystemClock::shared();

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

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (transport, handle) = PushFeedTransport::new(
        TransportConfig::from_config(&config),
        Arc::new(StaticTokenProvider::new(ApiKey::new("test-key".to_string()))),
        ConnectGate::new(),
        event_tx,
        cancel.clone(),
    );
    let feed_port: Arc<dyn PushFeedPort> = Arc::new(handle);

    let client = MarketDataClient::new(
        OrchestratorConfig::from_config(&config),
        store,
        cache,
        limiter,
        Arc::new(SnapshotClient::from_config(&config).unwrap()),
        feed_port,
    );
    let _ = client.start(event_rx, &cancel);
    tokio::spawn(transport.run());

    Harness {
        client,
        feed,
        cancel,
    }
}

fn collector() -> (
    impl Fn(&MarketData) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<MarketData>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |data: &MarketData| {
            let _ = tx.send(data.clone());
        },
        rx,
    )
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<MarketData>) -> MarketData {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("handler dropped")
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

// =============================================================================
// Subscribe
// =============================================================================

#[tokio::test]
async fn test_subscribe_seeds_over_rest_then_streams() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .and(query_param("tickers", "AAPL"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "tickers": [{
                "ticker": "AAPL",
                "day": {"o": 189.1, "h": 191.0, "l": 188.7, "c": 190.4, "v": 51_234_000},
                "prevDay": {"c": 189.2},
                "lastTrade": {"p": 190.42}
            }]
        })))
        .expect(1)
        .mount(&rest)
        .await;

    let mut h = start(&rest, |config| {
        config.rate_limit.requests_per_minute = 1;
        config.rate_limit.burst_size = 1;
    })
    .await;
    let (handler, mut updates) = collector();
    let mut sub = h.client.subscribe("AAPL", handler).unwrap();

    assert!(matches!(sub.seeded().await, SeedOutcome::Rest));

    let seeded = next_update(&mut updates).await;
    assert_eq!(seeded.price, Some(dec("190.42")));
    assert_eq!(seeded.metadata.source, DataSource::Rest);

    let auth = h.feed.next_frame().await;
    assert_eq!(auth.action, "auth");
    let subscribe = h.feed.next_action("subscribe").await;
    assert_eq!(subscribe.params, "AM.AAPL,T.AAPL,Q.AAPL");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(updates.try_recv().is_err(), "exactly one callback for the seed");

    let now = Utc::now().timestamp_millis();
    h.feed.push(&format!(
        r#"[{{"ev":"T","sym":"AAPL","p":191.05,"s":200,"t":{now}}}]"#
    ));

    let pushed = next_update(&mut updates).await;
    assert_eq!(pushed.price, Some(dec("191.05")));
    assert_eq!(pushed.metadata.source, DataSource::Push);
}

#[tokio::test]
async fn test_concurrent_subscribers_share_one_fetch() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .and(query_param("tickers", "MSFT"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(200))
                .set_body_json(json!({
                    "status": "OK",
                    "tickers": [{"ticker": "MSFT", "lastTrade": {"p": 410.5}}]
                })),
        )
        .expect(1)
        .mount(&rest)
        .await;

    let mut h = start(&rest, |_| {}).await;
    let (first_handler, mut first) = collector();
    let (second_handler, mut second) = collector();

    let client_a = h.client.clone();
    let client_b = h.client.clone();
    let (a, b) = tokio::join!(
        async move {
            let mut sub = client_a.subscribe("MSFT", first_handler).unwrap();
            let outcome = sub.seeded().await;
            (sub, outcome)
        },
        async move {
            let mut sub = client_b.subscribe("MSFT", second_handler).unwrap();
            let outcome = sub.seeded().await;
            (sub, outcome)
        },
    );

    let outcomes = [a.1.as_str(), b.1.as_str()];
    assert!(outcomes.contains(&"rest"));
    assert!(outcomes.contains(&"joined"));

    assert_eq!(next_update(&mut first).await.price, Some(dec("410.5")));
    assert_eq!(next_update(&mut second).await.price, Some(dec("410.5")));

    let subscribe = h.feed.next_action("subscribe").await;
    assert_eq!(subscribe.params, "AM.MSFT,T.MSFT,Q.MSFT");
    assert_eq!(h.client.store().subscriber_count(&common::sym("MSFT")), 2);
}

#[tokio::test]
async fn test_last_unsubscribe_releases_push_interest() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "tickers": [{"ticker": "NVDA", "lastTrade": {"p": 120.0}}]
        })))
        .mount(&rest)
        .await;

    let mut h = start(&rest, |_| {}).await;
    let mut first = h.client.subscribe("NVDA", |_: &MarketData| {}).unwrap();
    let second = h.client.subscribe("NVDA", |_: &MarketData| {}).unwrap();
    let _ = first.seeded().await;
    let _ = h.feed.next_action("subscribe").await;

    first.unsubscribe();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.feed.drain().iter().all(|f| f.action != "unsubscribe"));

    drop(second);
    let frame = h.feed.next_action("unsubscribe").await;
    assert_eq!(frame.params, "AM.NVDA,T.NVDA,Q.NVDA");
}

#[tokio::test]
async fn test_unsubscribe_while_fetching_skips_push_interest() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .and(query_param("tickers", "AMD"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_json(json!({
                    "status": "OK",
                    "tickers": [{"ticker": "AMD", "lastTrade": {"p": 155.3}}]
                })),
        )
        .expect(1)
        .mount(&rest)
        .await;

    let mut h = start(&rest, |_| {}).await;
    let amd = common::sym("AMD");
    let sub = h.client.subscribe("AMD", |_: &MarketData| {}).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    sub.unsubscribe();
    assert!(!h.client.store().has_subscribers(&amd));

    timeout(WAIT, async {
        while h.client.store().get(&amd).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fetch in flight was abandoned");
    assert_eq!(h.client.store().get(&amd).unwrap().price, Some(dec("155.3")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        h.feed.drain().iter().all(|f| f.action != "subscribe"),
        "no push interest after the last subscriber left"
    );
}

// =============================================================================
// Snapshot
// =============================================================================

#[tokio::test]
async fn test_snapshot_serves_fresh_data_locally() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .and(query_param("tickers", "AAPL,MSFT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "tickers": [
                {"ticker": "AAPL", "lastTrade": {"p": 190.0}},
                {"ticker": "MSFT", "lastTrade": {"p": 410.0}}
            ]
        })))
        .expect(1)
        .mount(&rest)
        .await;

    let h = start(&rest, |_| {}).await;

    let first = h.client.get_snapshot(&["AAPL", "MSFT"]).await.unwrap();
    assert_eq!(first.len(), 2);

    let again = h.client.get_snapshot(&["msft", "AAPL"]).await.unwrap();
    assert_eq!(again[&common::sym("MSFT")].price, Some(dec("410.0")));
}

#[tokio::test]
async fn test_snapshot_rate_limited_without_waiting() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "tickers": []
        })))
        .expect(1)
        .mount(&rest)
        .await;

    let h = start(&rest, |config| {
        config.rate_limit.requests_per_minute = 1;
        config.rate_limit.burst_size = 1;
    })
    .await;

    assert!(h.client.get_snapshot(&["AAPL"]).await.unwrap().is_empty());

    let err = h.client.get_snapshot(&["TSLA"]).await.unwrap_err();
    assert!(matches!(err, ClientError::RateLimited { .. }));
}

// =============================================================================
// Connection Status
// =============================================================================

#[tokio::test]
async fn test_connection_status_reaches_authenticated() {
    let rest = MockServer::start().await;
    let h = start(&rest, |_| {}).await;

    let mut status = h.client.connection_status();
    timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Authenticated))
        .await
        .expect("feed never authenticated")
        .unwrap();
}
