//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): requests by method, status
//! - `http_request_duration_seconds` (histogram): latency by method
//! - `subtask_completions_total` (counter): child operations by kind, state
//! - `request_body_decode_total` (counter): body decodes by encoding, outcome
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Prometheus exporter is optional and owns its own listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::subtask::TaskState;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one handled request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record a finished child operation.
pub fn record_subtask(kind: &'static str, state: TaskState) {
    counter!("subtask_completions_total", "kind" => kind, "state" => state.as_str()).increment(1);
}

/// Record a request body content-decoding attempt.
pub fn record_body_decode(encoding: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "fallback" };
    counter!("request_body_decode_total", "encoding" => encoding, "outcome" => outcome).increment(1);
}
