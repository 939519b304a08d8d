//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rawhttp_pool_hits_total` (counter): acquires served from the idle set or a live h2 connection
//! - `rawhttp_pool_misses_total` (counter): acquires that dialed
//! - `rawhttp_pool_evictions_total` (counter): idle connections closed by the global LRU cap
//! - `rawhttp_pool_retries_total` (counter): exchanges retried on a fresh connection
//! - `rawhttp_pool_idle_connections` (gauge): idle HTTP/1.1 connections
//! - `rawhttp_h2_downgrades_total` (counter): HTTP/2 attempts that fell back to HTTP/1.1
//! - `rawhttp_proxy_connections_total{path}` (counter): accepted proxy connections, `tls` or `plain`
//! - `rawhttp_proxy_exchanges_total{mode}` (counter): request/response pairs, `forward` or `hijack`

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
/// Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_pool_hit() {
    counter!("rawhttp_pool_hits_total").increment(1);
}

pub fn record_pool_miss() {
    counter!("rawhttp_pool_misses_total").increment(1);
}

pub fn record_pool_eviction() {
    counter!("rawhttp_pool_evictions_total").increment(1);
}

pub fn record_pool_retry() {
    counter!("rawhttp_pool_retries_total").increment(1);
}

pub fn set_idle_connections(count: usize) {
    gauge!("rawhttp_pool_idle_connections").set(count as f64);
}

pub fn record_h2_downgrade() {
    counter!("rawhttp_h2_downgrades_total").increment(1);
}

pub fn record_proxy_connection(tls: bool) {
    let path = if tls { "tls" } else { "plain" };
    counter!("rawhttp_proxy_connections_total", "path" => path).increment(1);
}

pub fn record_proxy_exchange(mode: &'static str) {
    counter!("rawhttp_proxy_exchanges_total", "mode" => mode).increment(1);
}
