//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Order announcements and fill decisions
//! - Escrow deployments, withdrawals and recoveries
//! - Invariant violations
//! - Chain health and confirmation latency

use crate::coordination::RecoverOutcome;
use crate::error::{SwapError, SwapResult};
use crate::types::Side;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_swap_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_swap_chain_block_height",
        "Latest observed block height per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_REJECTIONS: CounterVec = register_counter_vec!(
        "htlc_swap_chain_rejections_total",
        "Calls rejected by an escrow ledger",
        &["chain_id", "call"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "htlc_swap_confirmation_latency_seconds",
        "Time from submission to required confirmation depth",
        &["chain_id"],
        vec![0.05, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref CONFIRMATION_TIMEOUTS: CounterVec = register_counter_vec!(
        "htlc_swap_confirmation_timeouts_total",
        "Confirmation waits that hit the timeout",
        &["chain_id"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS_ANNOUNCED: CounterVec = register_counter_vec!(
        "htlc_swap_orders_announced_total",
        "Total orders announced",
        &["chain_id"]
    ).unwrap();

    pub static ref FILLS_ACCEPTED: CounterVec = register_counter_vec!(
        "htlc_swap_fills_accepted_total",
        "Total fills accepted",
        &[]
    ).unwrap();

    pub static ref FILLS_REJECTED: CounterVec = register_counter_vec!(
        "htlc_swap_fills_rejected_total",
        "Total fills rejected by reason",
        &["reason"]
    ).unwrap();

    // Escrow metrics
    pub static ref ESCROWS_CREATED: CounterVec = register_counter_vec!(
        "htlc_swap_escrows_created_total",
        "Escrows deployed and verified",
        &["side"]
    ).unwrap();

    pub static ref WITHDRAWALS: CounterVec = register_counter_vec!(
        "htlc_swap_withdrawals_total",
        "Escrow withdrawals",
        &["side"]
    ).unwrap();

    pub static ref RECOVERIES: CounterVec = register_counter_vec!(
        "htlc_swap_recoveries_total",
        "Escrow recoveries by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref INVARIANT_VIOLATIONS: CounterVec = register_counter_vec!(
        "htlc_swap_invariant_violations_total",
        "Detected invariant violations by kind",
        &["kind"]
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

    pub fn router() -> Router {
        Router::new().route("/metrics", get(metrics_handler))
    }

    pub async fn run(&self) -> SwapResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, Self::router())
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_chain_rejection(chain_id: u64, call: &str) {
    CHAIN_REJECTIONS
        .with_label_values(&[&chain_id.to_string(), call])
        .inc();
}

pub fn record_confirmation_latency(chain_id: u64, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_confirmation_timeout(chain_id: u64) {
    CONFIRMATION_TIMEOUTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_order_announced(chain_id: u64) {
    ORDERS_ANNOUNCED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fill_accepted() {
    FILLS_ACCEPTED.with_label_values(&[]).inc();
}

pub fn record_fill_rejected(reason: &str) {
    FILLS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_escrow_created(side: Side) {
    ESCROWS_CREATED
        .with_label_values(&[&side.to_string()])
        .inc();
}

pub fn record_withdrawal(side: Side) {
    WITHDRAWALS.with_label_values(&[&side.to_string()]).inc();
}

pub fn record_recovery(outcome: RecoverOutcome) {
    let label = match outcome {
        RecoverOutcome::Recovered => "recovered",
        RecoverOutcome::AlreadyRecovered => "already_recovered",
    };
    RECOVERIES.with_label_values(&[label]).inc();
}

pub fn record_invariant_violation(kind: &str) {
    INVARIANT_VIOLATIONS.with_label_values(&[kind]).inc();
}
