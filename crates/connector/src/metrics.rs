//! Prometheus metrics for the quote stream
//!
//! Process-wide statics registered on first use with the default registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

const LABEL_EXCHANGE: &str = "exchange";
const LABEL_REASON: &str = "reason";
const LABEL_GRANULARITY: &str = "granularity";
const LABEL_KIND: &str = "kind";

static TICKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quotebar_ticks_total",
        "Ticks dispatched to the cache and the bar engine",
        &[LABEL_EXCHANGE]
    )
    .expect("Failed to register ticks_total metric")
});

static PAYLOADS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quotebar_payloads_dropped_total",
        "Decoded payloads dropped without producing a tick",
        &[LABEL_REASON]
    )
    .expect("Failed to register payloads_dropped metric")
});

static HEARTBEATS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "quotebar_heartbeats_echoed_total",
        "Provider heartbeats echoed back"
    )
    .expect("Failed to register heartbeats metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "quotebar_reconnect_attempts_total",
        "Connection attempts made after a failure"
    )
    .expect("Failed to register reconnects metric")
});

static CONNECTION_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "quotebar_connection_state",
        "Protocol client state (0=disconnected 1=connecting 2=connected 3=resubscribing 4=running 5=backing_off 6=closed)"
    )
    .expect("Failed to register connection_state metric")
});

static SUBSCRIBED_INSTRUMENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "quotebar_subscribed_instruments",
        "Instruments in the subscription registry"
    )
    .expect("Failed to register subscribed_instruments metric")
});

static BARS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quotebar_bars_emitted_total",
        "Completed bars handed to the sink",
        &[LABEL_GRANULARITY, LABEL_REASON]
    )
    .expect("Failed to register bars_emitted metric")
});

static SINK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "quotebar_sink_failures_total",
        "Bar upserts that returned an error"
    )
    .expect("Failed to register sink_failures metric")
});

static CACHE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quotebar_cache_failures_total",
        "Cache writes that returned an error",
        &[LABEL_KIND]
    )
    .expect("Failed to register cache_failures metric")
});

pub fn inc_tick(exchange: &str) {
    TICKS_TOTAL.with_label_values(&[exchange]).inc();
}

pub fn inc_dropped(reason: &str) {
    PAYLOADS_DROPPED.with_label_values(&[reason]).inc();
}

pub fn inc_heartbeat() {
    HEARTBEATS_TOTAL.inc();
}

pub fn inc_reconnect() {
    RECONNECTS_TOTAL.inc();
}

pub fn set_connection_state(code: i64) {
    CONNECTION_STATE.set(code);
}

pub fn set_subscribed(count: usize) {
    SUBSCRIBED_INSTRUMENTS.set(count as i64);
}

pub fn inc_bar_emitted(granularity: &str, reason: &str) {
    BARS_EMITTED.with_label_values(&[granularity, reason]).inc();
}

pub fn inc_sink_failure() {
    SINK_FAILURES.inc();
}

pub fn inc_cache_failure(kind: &str) {
    CACHE_FAILURES.with_label_values(&[kind]).inc();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
