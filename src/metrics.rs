//! Prometheus metrics for monitoring
//!
//! Counters for loop health and bridge traffic, exported through a small
//! axum endpoint. There is no other HTTP surface in the process.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

use axum::{routing::get, Router};

lazy_static! {
    pub static ref LOOP_ERRORS: CounterVec = register_counter_vec!(
        "gantry_loop_errors_total",
        "Iteration errors absorbed by the supervisor, per loop",
        &["loop"]
    )
    .unwrap();

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "gantry_events_observed_total",
        "Bridge contract events scanned by the oracle, by type",
        &["event_type"]
    )
    .unwrap();

    pub static ref CLAIMS_SUBMITTED: CounterVec = register_counter_vec!(
        "gantry_claims_submitted_total",
        "Claim messages submitted to the sidechain, by type",
        &["claim_type"]
    )
    .unwrap();

    pub static ref CONFIRMS_SUBMITTED: CounterVec = register_counter_vec!(
        "gantry_confirms_submitted_total",
        "Valset and batch confirms queued to the sidechain",
        &["kind"]
    )
    .unwrap();

    pub static ref ETH_TX_SUBMITTED: CounterVec = register_counter_vec!(
        "gantry_eth_tx_submitted_total",
        "Ethereum transactions broadcast, by kind",
        &["kind"]
    )
    .unwrap();

    pub static ref RELAY_SKIPPED: CounterVec = register_counter_vec!(
        "gantry_relay_skipped_total",
        "Relay attempts skipped without error, by reason",
        &["reason"]
    )
    .unwrap();

    pub static ref BATCH_REQUESTS: CounterVec = register_counter_vec!(
        "gantry_batch_requests_total",
        "Batch requests issued to the sidechain",
        &["denom"]
    )
    .unwrap();

    pub static ref ORACLE_LAST_SCANNED: GaugeVec = register_gauge_vec!(
        "gantry_oracle_last_scanned_block",
        "Highest Ethereum block the oracle has scanned",
        &[]
    )
    .unwrap();

    pub static ref PENDING_TX_SET_SIZE: GaugeVec = register_gauge_vec!(
        "gantry_pending_tx_set_size",
        "Calldata digests currently tracked as pending",
        &[]
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_loop_error(loop_name: &str) {
    LOOP_ERRORS.with_label_values(&[loop_name]).inc();
}

pub fn record_event_observed(event_type: &str) {
    EVENTS_OBSERVED.with_label_values(&[event_type]).inc();
}

pub fn record_claim_submitted(claim_type: &str) {
    CLAIMS_SUBMITTED.with_label_values(&[claim_type]).inc();
}

pub fn record_confirm_submitted(kind: &str) {
    CONFIRMS_SUBMITTED.with_label_values(&[kind]).inc();
}

pub fn record_eth_tx_submitted(kind: &str) {
    ETH_TX_SUBMITTED.with_label_values(&[kind]).inc();
}

pub fn record_relay_skipped(reason: &str) {
    RELAY_SKIPPED.with_label_values(&[reason]).inc();
}

pub fn record_batch_request(denom: &str) {
    BATCH_REQUESTS.with_label_values(&[denom]).inc();
}

pub fn record_last_scanned_block(block: u64) {
    ORACLE_LAST_SCANNED.with_label_values(&[]).set(block as f64);
}

pub fn record_pending_tx_set_size(size: usize) {
    PENDING_TX_SET_SIZE.with_label_values(&[]).set(size as f64);
}
