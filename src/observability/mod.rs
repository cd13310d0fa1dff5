//! Logging and Prometheus metrics for flexblock.

use crate::config::ObservabilityConfig;
use crate::error::{FlexError, Result};
use crate::types::IoOperation;
use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| FlexError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| FlexError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Serve `/metrics` in Prometheus text format until shutdown.
pub async fn run_metrics_server(
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| FlexError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    describe_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| FlexError::Network(e.to_string()))?;

    Ok(())
}

fn describe_metrics() {
    // Manager
    describe_counter!("flexblock_tokens_issued_total", "IO tokens issued by the authority");
    describe_counter!("flexblock_chunks_allocated_total", "Chunks placed by the placement engine");
    describe_counter!("flexblock_node_failures_total", "Storage nodes declared DOWN");
    describe_counter!("flexblock_rebuild_bytes_total", "Bytes copied by rebuild");
    describe_counter!("flexblock_io_ops_total", "Acknowledged IOs reported by storage nodes");
    describe_counter!("flexblock_io_bytes_total", "Bytes of acknowledged IO");
    describe_gauge!("flexblock_pool_health", "0 = OK, 1 = DEGRADED, 2 = FAILED");
    describe_gauge!("flexblock_pool_used_bytes", "Bytes charged against the pool");
    describe_gauge!("flexblock_pool_degraded_chunks", "Chunks below the pool's copy count");
    describe_gauge!("flexblock_node_up", "1 while the storage node is UP");
    describe_gauge!("flexblock_node_iops", "IOPS over the last metrics interval");

    // Storage node
    describe_counter!("flexblock_chunk_requests_total", "Data-plane requests served");
    describe_counter!("flexblock_chunk_errors_total", "Data-plane requests rejected");
    describe_counter!("flexblock_acks_dropped_total", "IO acknowledgements that failed to send");

    // Client
    describe_histogram!("flexblock_client_io_seconds", "Volume IO latency seen by the initiator");
    describe_counter!("flexblock_client_io_failures_total", "Volume IOs that returned an error");
}

/// Record one data-plane request on a storage node.
pub fn record_chunk_request(op: &'static str, ok: bool) {
    counter!("flexblock_chunk_requests_total", "op" => op).increment(1);
    if !ok {
        counter!("flexblock_chunk_errors_total", "op" => op).increment(1);
    }
}

/// Record one volume IO issued by the initiator.
pub fn record_client_io(operation: IoOperation, elapsed: Duration, ok: bool) {
    let op = operation.as_str();
    histogram!("flexblock_client_io_seconds", "op" => op).record(elapsed.as_secs_f64());
    if !ok {
        counter!("flexblock_client_io_failures_total", "op" => op).increment(1);
    }
}
