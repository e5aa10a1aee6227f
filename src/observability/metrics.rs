//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter): accepted client connections
//! - `proxy_active_connections` (gauge): connections currently handled
//! - `proxy_requests_total` (counter): decoded requests by kind (connect, http)
//! - `proxy_decode_failures_total` (counter): request heads that failed to parse
//! - `proxy_dial_failures_total` (counter): origin dials that failed, by kind
//! - `proxy_relay_bytes_total` (counter): tunnel bytes by direction
//!
//! Recording is a no-op until a recorder is installed, so the proxy runs the
//! same with metrics disabled.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::relay::RelayStats;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    metrics::counter!("proxy_connections_total").increment(1);
    metrics::gauge!("proxy_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("proxy_active_connections").decrement(1.0);
}

pub fn record_request(kind: &'static str) {
    metrics::counter!("proxy_requests_total", "kind" => kind).increment(1);
}

pub fn record_decode_failure() {
    metrics::counter!("proxy_decode_failures_total").increment(1);
}

pub fn record_dial_failure(kind: &'static str) {
    metrics::counter!("proxy_dial_failures_total", "kind" => kind).increment(1);
}

pub fn record_relay(stats: &RelayStats) {
    metrics::counter!("proxy_relay_bytes_total", "direction" => "upstream")
        .increment(stats.a_to_b);
    metrics::counter!("proxy_relay_bytes_total", "direction" => "downstream")
        .increment(stats.b_to_a);
}
