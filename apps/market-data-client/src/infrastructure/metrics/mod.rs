//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: Messages received, malformed items, reconnects, auth failures
//! - **REST**: Snapshot requests by outcome and latency
//! - **Rate limiting**: Local denials per identity
//! - **Cache**: Hits, misses and evictions per namespace
//! - **Store**: Updates by source, subscriptions, notification fan-out
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Without an
//! installed recorder every recording function is a no-op, which is what
//! unit tests rely on.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed
    describe_counter!(
        "market_data_feed_messages_total",
        "Push feed events received by kind"
    );
    describe_counter!(
        "market_data_malformed_messages_total",
        "Push feed items dropped during validation"
    );
    describe_counter!(
        "market_data_reconnects_total",
        "Push feed reconnection attempts"
    );
    describe_counter!(
        "market_data_auth_failures_total",
        "Push feed authentication failures"
    );
    describe_counter!(
        "market_data_subscribe_frames_total",
        "Subscribe and unsubscribe frames sent"
    );
    describe_gauge!(
        "market_data_connection_status",
        "Push feed status (0 disconnected .. 3 authenticated, 4 offline)"
    );

    // REST
    describe_counter!(
        "market_data_rest_requests_total",
        "Snapshot requests by outcome"
    );
    describe_histogram!(
        "market_data_rest_request_seconds",
        "Snapshot request latency"
    );

    // Rate limiting
    describe_counter!(
        "market_data_rate_limited_total",
        "Requests denied by the local rate limiter"
    );

    // Cache
    describe_counter!("market_data_cache_hits_total", "Cache hits by namespace");
    describe_counter!(
        "market_data_cache_misses_total",
        "Cache misses by namespace"
    );
    describe_counter!(
        "market_data_cache_evictions_total",
        "Cache entries evicted (lazy or sweep)"
    );

    // Store
    describe_counter!(
        "market_data_store_updates_total",
        "Records merged into the store by source"
    );
    describe_gauge!(
        "market_data_subscriptions",
        "Registered subscriber handlers"
    );
    describe_histogram!(
        "market_data_notification_fanout",
        "Handlers invoked per symbol flush"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a push feed event.
pub fn record_feed_message(kind: &'static str) {
    counter!("market_data_feed_messages_total", "kind" => kind).increment(1);
}

/// Record a feed item dropped during validation.
pub fn record_malformed_message(kind: &'static str) {
    counter!("market_data_malformed_messages_total", "kind" => kind).increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("market_data_reconnects_total").increment(1);
}

/// Record an authentication failure.
pub fn record_auth_failure(reason: &'static str) {
    counter!("market_data_auth_failures_total", "reason" => reason).increment(1);
}

/// Record subscribe/unsubscribe frames sent.
pub fn record_subscribe_frame(action: &'static str) {
    counter!("market_data_subscribe_frames_total", "action" => action).increment(1);
}

const fn status_value(status: ConnectionStatus) -> f64 {
    match status {
        ConnectionStatus::Disconnected => 0.0,
        ConnectionStatus::Connecting => 1.0,
        ConnectionStatus::Connected => 2.0,
        ConnectionStatus::Authenticated => 3.0,
        ConnectionStatus::Offline => 4.0,
    }
}

/// Update the connection status gauge.
pub fn set_connection_status(status: ConnectionStatus) {
    gauge!("market_data_connection_status").set(status_value(status));
}

/// Record a snapshot request.
pub fn record_rest_request(outcome: &'static str, duration: Duration) {
    counter!("market_data_rest_requests_total", "outcome" => outcome).increment(1);
    histogram!("market_data_rest_request_seconds").record(duration.as_secs_f64());
}

/// Record a local rate limit denial.
pub fn record_rate_limited(identity: &str) {
    counter!(
        "market_data_rate_limited_total",
        "identity" => identity.to_string()
    )
    .increment(1);
}

/// Record a cache lookup.
pub fn record_cache_lookup(namespace: &'static str, hit: bool) {
    if hit {
        counter!("market_data_cache_hits_total", "namespace" => namespace).increment(1);
    } else {
        counter!("market_data_cache_misses_total", "namespace" => namespace).increment(1);
    }
}

/// Record evicted cache entries.
pub fn record_cache_evictions(namespace: &'static str, count: u64) {
    counter!("market_data_cache_evictions_total", "namespace" => namespace).increment(count);
}

/// Record a store merge.
pub fn record_store_update(source: &'static str) {
    counter!("market_data_store_updates_total", "source" => source).increment(1);
}

/// Update the subscriber gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("market_data_subscriptions").set(count as f64);
}

/// Record how many handlers one flush invoked for a symbol.
#[allow(clippy::cast_precision_loss)]
pub fn record_notification_fanout(handlers: usize) {
    histogram!("market_data_notification_fanout").record(handlers as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_feed_message("trade");
        record_malformed_message("quote");
        record_cache_lookup("market", true);
        record_cache_lookup("market", false);
        record_rest_request("ok", Duration::from_millis(5));
        set_connection_status(ConnectionStatus::Offline);
        set_subscriptions(3);
    }

    #[test]
    fn status_gauge_orders_by_progress() {
        assert_eq!(status_value(ConnectionStatus::Disconnected), 0.0);
        assert_eq!(status_value(ConnectionStatus::Authenticated), 3.0);
        assert_eq!(status_value(ConnectionStatus::Offline), 4.0);
    }
}
