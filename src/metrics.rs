//! Prometheus metrics surface (§4.8, §6).
//!
//! Every counter, gauge, and histogram named in §6 is emitted through the
//! `metrics` facade crate at the point of state change — never deferred to
//! a caller-side wrapper — so call sites stay declarative instead of
//! threading a registry handle through every function signature. A
//! `metrics-exporter-prometheus` recorder renders the standard exposition
//! format for the `/metrics` route mounted by the metainfo HTTP server
//! (§4.6, §4.8).

use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::P2pError;

/// Install the global Prometheus recorder and return the handle used to
/// render `/metrics` responses. Must be called exactly once, before the
/// first metric is emitted (mirrors the single `tracing_subscriber::fmt`
/// install at process entry — §4.11).
pub fn install() -> Result<PrometheusHandle, P2pError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| P2pError::InvalidConfig(format!("failed to install metrics recorder: {err}")))
}

fn name(namespace: &str, suffix: &str) -> String {
    format!("{namespace}_p2p_{suffix}")
}

pub fn download_started(namespace: &str, source: &str, id: &str) {
    metrics::counter!(name(namespace, "download_total"), "source" => source.to_string(), "id" => id.to_string())
        .increment(1);
    metrics::gauge!(name(namespace, "downloads_in_flight")).increment(1.0);
}

pub fn download_completed(namespace: &str, source: &str, id: &str, duration: Duration) {
    metrics::histogram!(name(namespace, "download_duration_seconds"), "source" => source.to_string(), "id" => id.to_string())
        .record(duration.as_secs_f64());
    metrics::gauge!(name(namespace, "downloads_in_flight")).decrement(1.0);
}

pub fn download_failed(namespace: &str, id: &str, reason: &str) {
    metrics::counter!(name(namespace, "download_failures_total"), "id" => id.to_string(), "reason" => reason.to_string())
        .increment(1);
    metrics::gauge!(name(namespace, "downloads_in_flight")).decrement(1.0);
}

pub fn verification_failed(namespace: &str, id: &str) {
    metrics::counter!(name(namespace, "verification_failures_total"), "id" => id.to_string()).increment(1);
}

pub fn bytes_p2p(namespace: &str, id: &str, bytes: u64) {
    metrics::counter!(name(namespace, "download_bytes_p2p_total"), "id" => id.to_string()).increment(bytes);
}

pub fn bytes_origin(namespace: &str, id: &str, bytes: u64) {
    metrics::counter!(name(namespace, "download_bytes_hf_total"), "id" => id.to_string()).increment(bytes);
}

pub fn peers_discovered(namespace: &str, id: &str, count: usize) {
    metrics::gauge!(name(namespace, "peers_discovered"), "id" => id.to_string()).set(count as f64);
}

pub fn peers_connected(namespace: &str, id: &str, count: usize) {
    metrics::gauge!(name(namespace, "peers_connected"), "id" => id.to_string()).set(count as f64);
}

pub fn leases_acquired(namespace: &str) {
    metrics::counter!(name(namespace, "leases_acquired_total")).increment(1);
}

pub fn leases_waiting(namespace: &str, count: u64) {
    metrics::gauge!(name(namespace, "leases_waiting")).set(count as f64);
}

pub fn seeding_torrents(namespace: &str, count: usize) {
    metrics::gauge!(name(namespace, "seeding_torrents")).set(count as f64);
}

pub fn bytes_uploaded(namespace: &str, bytes: u64) {
    metrics::counter!(name(namespace, "bytes_uploaded_total")).increment(bytes);
}

pub fn bytes_downloaded(namespace: &str, bytes: u64) {
    metrics::counter!(name(namespace, "bytes_downloaded_total")).increment(bytes);
}

pub fn download_ratio(namespace: &str, p2p_bytes: u64, total_bytes: u64) {
    let ratio = if total_bytes == 0 {
        0.0
    } else {
        p2p_bytes as f64 / total_bytes as f64
    };
    metrics::gauge!(name(namespace, "download_ratio")).set(ratio);
}

pub fn metainfo_request(namespace: &str, status: u16) {
    metrics::counter!(name(namespace, "metainfo_requests_total"), "status" => status.to_string())
        .increment(1);
}

pub fn metainfo_latency(namespace: &str, id: &str, duration: Duration) {
    metrics::histogram!(name(namespace, "metainfo_latency_seconds"), "id" => id.to_string())
        .record(duration.as_secs_f64());
}
