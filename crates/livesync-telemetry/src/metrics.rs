//! Prometheus metrics for the live-data pipeline.
//!
//! # Panics
//!
//! Registration uses `unwrap()`. A failure means duplicate metric names,
//! which is a startup bug; it can only happen during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_gauge, CounterVec, Encoder,
    IntCounter, IntGauge, TextEncoder,
};

/// Push transport connected (1) or not (0).
pub static INGRESS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "livesync_ingress_connected",
        "Push connection state (1=connected)"
    )
    .unwrap()
});

/// Reconnect attempts on the push transport.
pub static INGRESS_RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "livesync_ingress_reconnect_total",
        "Total push reconnection attempts"
    )
    .unwrap()
});

/// Messages applied by the store, by kind.
pub static MESSAGES_PROCESSED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livesync_messages_processed_total",
        "Messages applied to the store",
        &["kind"]
    )
    .unwrap()
});

/// Messages dropped by the store, by reason.
pub static MESSAGES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livesync_messages_dropped_total",
        "Messages dropped by the store",
        &["reason"]
    )
    .unwrap()
});

/// Coalesced subscriber notifications.
pub static NOTIFICATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "livesync_notifications_total",
        "Coalesced store notifications"
    )
    .unwrap()
});

/// Upstream API calls by outcome (hit/miss/rate_limited/error).
pub static API_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livesync_api_requests_total",
        "Rate-limited cache requests by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Facade over the metric statics.
pub struct Metrics;

impl Metrics {
    pub fn set_ingress_connected(connected: bool) {
        INGRESS_CONNECTED.set(i64::from(connected));
    }

    pub fn ingress_reconnect() {
        INGRESS_RECONNECT_TOTAL.inc();
    }

    pub fn message_processed(kind: &str) {
        MESSAGES_PROCESSED_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn message_dropped(reason: &str) {
        MESSAGES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn notification() {
        NOTIFICATIONS_TOTAL.inc();
    }

    pub fn api_request(outcome: &str) {
        API_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Render the default registry in Prometheus text format.
    pub fn render() -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
