//! Prometheus metrics endpoint.
//!
//! Exposes the pipeline counters and per-queue consumer counters in
//! Prometheus exposition format via a lightweight HTTP server. Pipeline
//! counters come from the eBPF per-CPU map, consumer counters from
//! userspace atomics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tokio::sync::Mutex;
use tracing::info;

use crate::af_xdp::ConsumerStats;
use crate::config::MetricsConfig;
use crate::ebpf_manager::EbpfManager;

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

/// Shared state for the metrics endpoint.
#[derive(Clone)]
pub struct MetricsState {
    /// eBPF manager for reading the per-CPU counters map. Boxed in an
    /// Option so shutdown can take it out for detach.
    pub ebpf_manager: Arc<Mutex<Option<EbpfManager>>>,
    /// Per-queue consumer stats.
    pub consumer_stats: Arc<Vec<(u32, Arc<ConsumerStats>)>>,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let mut output = String::with_capacity(4096);

    // --- Header comments ---
    output.push_str("# HELP dns_divert_packets_total Frames inspected by the XDP program\n");
    output.push_str("# TYPE dns_divert_packets_total counter\n");
    output.push_str("# HELP dns_divert_dns_packets_total Frames classified as DNS\n");
    output.push_str("# TYPE dns_divert_dns_packets_total counter\n");
    output.push_str("# HELP dns_divert_redirected_total DNS frames redirected to AF_XDP sockets\n");
    output.push_str("# TYPE dns_divert_redirected_total counter\n");
    output.push_str("# HELP dns_divert_blocked_total DNS frames dropped by the denylist\n");
    output.push_str("# TYPE dns_divert_blocked_total counter\n");
    output.push_str("# HELP dns_divert_passed_total DNS frames passed to the kernel stack\n");
    output.push_str("# TYPE dns_divert_passed_total counter\n");
    output.push_str("# HELP dns_divert_bypassed_total Frames redirected by the protocol bypass\n");
    output.push_str("# TYPE dns_divert_bypassed_total counter\n");
    output.push_str("# HELP dns_divert_consumer_frames_total Frames drained from the RX ring\n");
    output.push_str("# TYPE dns_divert_consumer_frames_total counter\n");
    output.push_str("# HELP dns_divert_consumer_bytes_total Bytes drained from the RX ring\n");
    output.push_str("# TYPE dns_divert_consumer_bytes_total counter\n");
    output.push_str("# HELP dns_divert_consumer_queries_total Drained frames with the DNS QR bit clear\n");
    output.push_str("# TYPE dns_divert_consumer_queries_total counter\n");
    output.push_str("# HELP dns_divert_consumer_responses_total Drained frames with the DNS QR bit set\n");
    output.push_str("# TYPE dns_divert_consumer_responses_total counter\n");
    output.push_str("# HELP dns_divert_consumer_parse_errors_total Drained frames with no locatable DNS header\n");
    output.push_str("# TYPE dns_divert_consumer_parse_errors_total counter\n");
    output.push_str("# HELP dns_divert_consumer_unexpected_total Drained frames the current tables would not redirect\n");
    output.push_str("# TYPE dns_divert_consumer_unexpected_total counter\n");
    output.push_str("# HELP dns_divert_consumer_rx_ring_empty_total Poll wakeups that found the RX ring empty\n");
    output.push_str("# TYPE dns_divert_consumer_rx_ring_empty_total counter\n");
    output.push_str("# HELP dns_divert_consumer_fill_ring_full_total Refill attempts rejected by a full fill ring\n");
    output.push_str("# TYPE dns_divert_consumer_fill_ring_full_total counter\n");

    // --- Pipeline counters (eBPF per-CPU map) ---
    if let Some(ref mgr) = *state.ebpf_manager.lock().await {
        match mgr.read_metrics() {
            Ok(snapshot) => {
                write_counter(&mut output, "dns_divert_packets_total", snapshot.total_packets);
                write_counter(&mut output, "dns_divert_dns_packets_total", snapshot.dns_packets);
                write_counter(&mut output, "dns_divert_redirected_total", snapshot.redirected);
                write_counter(&mut output, "dns_divert_blocked_total", snapshot.blocked);
                write_counter(&mut output, "dns_divert_passed_total", snapshot.passed);
                write_counter(&mut output, "dns_divert_bypassed_total", snapshot.bypassed);
            }
            Err(e) => {
                output.push_str(&format!("# ERROR reading eBPF metrics: {}\n", e));
            }
        }
    }

    // --- Per-queue consumer counters ---
    for (queue, stats) in state.consumer_stats.iter() {
        use std::sync::atomic::Ordering::Relaxed;
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_frames_total",
            *queue,
            stats.frames.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_bytes_total",
            *queue,
            stats.bytes.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_queries_total",
            *queue,
            stats.queries.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_responses_total",
            *queue,
            stats.responses.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_parse_errors_total",
            *queue,
            stats.parse_errors.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_unexpected_total",
            *queue,
            stats.unexpected.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_rx_ring_empty_total",
            *queue,
            stats.rx_ring_empty.load(Relaxed),
        );
        write_queue_metric(
            &mut output,
            "dns_divert_consumer_fill_ring_full_total",
            *queue,
            stats.fill_ring_full.load(Relaxed),
        );
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

fn write_counter(output: &mut String, metric: &str, value: u64) {
    output.push_str(&format!("{} {}\n", metric, value));
}

fn write_queue_metric(output: &mut String, metric: &str, queue: u32, value: u64) {
    output.push_str(&format!("{}{{queue=\"{}\"}} {}\n", metric, queue, value));
}
