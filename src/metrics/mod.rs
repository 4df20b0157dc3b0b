//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain reachability and finalized head
//! - Submission outcomes and retries
//! - Fee estimation fallbacks
//! - Confirmation latency

use crate::error::{EngineError, EngineResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "identity_engine_chain_healthy",
        "Chain reachability (1=healthy, 0=unreachable)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_FINALIZED_HEAD: GaugeVec = register_gauge_vec!(
        "identity_engine_chain_finalized_head",
        "Last observed finalized head per chain",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "identity_engine_transactions_submitted_total",
        "Total transactions accepted by the node",
        &["chain"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "identity_engine_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "identity_engine_transactions_failed_total",
        "Total transactions failed by error category",
        &["chain", "category"]
    ).unwrap();

    pub static ref TX_TIMEOUT: CounterVec = register_counter_vec!(
        "identity_engine_transactions_timeout_total",
        "Total transactions that timed out awaiting confirmation",
        &["chain"]
    ).unwrap();

    pub static ref TX_RETRIES: CounterVec = register_counter_vec!(
        "identity_engine_retries_total",
        "Total submission retries by error category",
        &["chain", "category"]
    ).unwrap();

    pub static ref FEE_FALLBACKS: CounterVec = register_counter_vec!(
        "identity_engine_fee_fallbacks_total",
        "Total fee estimates that fell back to configured constants",
        &["chain"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "identity_engine_confirmation_latency_seconds",
        "Time from dispatch to terminal status",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Internal(format!("cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_finalized_head(chain: &str, block_number: u64) {
    CHAIN_FINALIZED_HEAD
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_tx_submitted(chain: &str) {
    TX_SUBMITTED.with_label_values(&[chain]).inc();
}

pub fn record_tx_confirmed(chain: &str) {
    TX_CONFIRMED.with_label_values(&[chain]).inc();
}

pub fn record_tx_failed(chain: &str, category: &str) {
    TX_FAILED.with_label_values(&[chain, category]).inc();
}

pub fn record_tx_timeout(chain: &str) {
    TX_TIMEOUT.with_label_values(&[chain]).inc();
}

pub fn record_retry(chain: &str, category: &str) {
    TX_RETRIES.with_label_values(&[chain, category]).inc();
}

pub fn record_fee_fallback(chain: &str) {
    FEE_FALLBACKS.with_label_values(&[chain]).inc();
}

pub fn record_tx_latency(chain: &str, latency_secs: f64) {
    TX_LATENCY.with_label_values(&[chain]).observe(latency_secs);
}
