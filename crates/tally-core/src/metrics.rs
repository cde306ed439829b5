//! Prometheus metrics helpers for tally.
//!
//! The sync engine records through the `metrics` facade; nothing is exported
//! unless a recorder is installed. Binaries call [`init_metrics`] once and
//! optionally expose the scrape endpoint with [`start_metrics_server`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use tally_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     if let Some(handle) = init_metrics() {
//!         start_metrics_server(9091, handle).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`sync_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `kind` (poll/vote) plus a small fixed set of reasons/outcomes

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed in this process.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = try_init_metrics()?;
    register_common_metrics();
    Some(handle)
}

/// Install the Prometheus recorder without registering descriptions.
///
/// Returns `None` if the recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` and serves `/metrics` from a background task.
/// Returns once the listener is bound.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the sync engine emits.
///
/// Called automatically by [`init_metrics`].
pub fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!(
        "sync_records_received_total",
        "Records received from the transport (labels: kind, path=historical|live)"
    );
    describe_counter!(
        "sync_records_invalid_total",
        "Records dropped as undecodable or structurally invalid (labels: kind, reason)"
    );
    describe_counter!(
        "sync_records_buffered_total",
        "Live records queued while waiting for the historical load (label: kind)"
    );

    // =========================================================================
    // Reconciliation
    // =========================================================================

    describe_counter!(
        "sync_records_applied_total",
        "Incremental reconcile outcomes (labels: kind, outcome=inserted|superseded|retained)"
    );
    describe_gauge!(
        "sync_canonical_records",
        "Records in the canonical set (label: kind)"
    );

    // =========================================================================
    // Historical retrieval
    // =========================================================================

    describe_counter!(
        "sync_historical_degraded_total",
        "Historical loads that fell back to empty (labels: kind, reason)"
    );
    describe_histogram!(
        "sync_historical_load_seconds",
        "Time spent loading a topic's history (label: kind)"
    );

    // =========================================================================
    // Coordinator
    // =========================================================================

    describe_gauge!(
        "sync_ready",
        "Whether the reconciled view is ready (1=ready, 0.5=degraded, 0=not ready)"
    );
    describe_counter!(
        "sync_publish_total",
        "Publish attempts (labels: kind, result=ok|invalid|failed)"
    );
}
