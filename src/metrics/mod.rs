//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and refresh failures
//! - Header cache efficiency and gas fallbacks
//! - Capability downgrades
//! - Receipt waits, decoding and tracing outcomes

use crate::error::{Capability, ClientError, ClientResult};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "ethpilot_nonces_allocated_total",
        "Total nonces handed out by the nonce manager",
        &["network"]
    ).unwrap();

    pub static ref NONCE_REFRESH_FAILURES: CounterVec = register_counter_vec!(
        "ethpilot_nonce_refresh_failures_total",
        "Total failed nonce refreshes",
        &["network"]
    ).unwrap();

    // Gas metrics
    pub static ref HEADER_CACHE_LOOKUPS: CounterVec = register_counter_vec!(
        "ethpilot_header_cache_lookups_total",
        "Header cache lookups by result",
        &["network", "result"]
    ).unwrap();

    pub static ref GAS_FALLBACKS: CounterVec = register_counter_vec!(
        "ethpilot_gas_fallbacks_total",
        "Gas estimations that fell back to configured values",
        &["network", "mode"]
    ).unwrap();

    pub static ref CAPABILITY_DOWNGRADES: CounterVec = register_counter_vec!(
        "ethpilot_capability_downgrades_total",
        "Node capabilities disabled for the lifetime of a client",
        &["network", "capability"]
    ).unwrap();

    // Transaction metrics
    pub static ref RECEIPT_WAIT: HistogramVec = register_histogram_vec!(
        "ethpilot_receipt_wait_seconds",
        "Time spent waiting for a transaction receipt",
        &["network"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref TX_DECODED: CounterVec = register_counter_vec!(
        "ethpilot_transactions_decoded_total",
        "Decoded transactions by outcome",
        &["network", "outcome"]
    ).unwrap();

    pub static ref TX_TRACED: CounterVec = register_counter_vec!(
        "ethpilot_transactions_traced_total",
        "Trace attempts by outcome",
        &["network", "outcome"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> ClientResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ClientError::Config(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ClientError::Config(format!("Metrics are not valid UTF-8: {}", e)))
}

// Helper functions to record metrics

pub fn record_nonce_allocated(network: &str) {
    NONCES_ALLOCATED.with_label_values(&[network]).inc();
}

pub fn record_nonce_refresh_failure(network: &str) {
    NONCE_REFRESH_FAILURES.with_label_values(&[network]).inc();
}

pub fn record_header_cache(network: &str, hits: usize, misses: usize) {
    HEADER_CACHE_LOOKUPS
        .with_label_values(&[network, "hit"])
        .inc_by(hits as f64);
    HEADER_CACHE_LOOKUPS
        .with_label_values(&[network, "miss"])
        .inc_by(misses as f64);
}

pub fn record_gas_fallback(network: &str, mode: &str) {
    GAS_FALLBACKS.with_label_values(&[network, mode]).inc();
}

pub fn record_capability_downgrade(network: &str, capability: Capability) {
    CAPABILITY_DOWNGRADES
        .with_label_values(&[network, &capability.to_string()])
        .inc();
}

pub fn observe_receipt_wait(network: &str, secs: f64) {
    RECEIPT_WAIT.with_label_values(&[network]).observe(secs);
}

pub fn record_decoded(network: &str, outcome: &str) {
    TX_DECODED.with_label_values(&[network, outcome]).inc();
}

pub fn record_trace(network: &str, outcome: &str) {
    TX_TRACED.with_label_values(&[network, outcome]).inc();
}
