//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): relayed requests by method, status
//! - `proxy_request_duration_seconds` (histogram): time to upstream response head
//! - `proxy_upstream_errors_total` (counter): failed exchanges by kind
//! - `proxy_active_connections` (gauge): open client connections
//! - `proxy_active_bridges` (gauge): open upgrade bridges
//! - `proxy_bridge_bytes_total` (counter): bridged bytes by direction
//!
//! Recording goes through the `metrics` facade and is a no-op until an
//! exporter is installed.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with an HTTP scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a relayed request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Record an exchange that failed before a response could be relayed.
pub fn record_upstream_error(kind: &'static str) {
    counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn connection_opened() {
    gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("proxy_active_connections").decrement(1.0);
}

pub fn bridge_opened() {
    gauge!("proxy_active_bridges").increment(1.0);
}

/// Record a finished bridge and the bytes it moved.
pub fn bridge_closed(client_to_upstream: u64, upstream_to_client: u64) {
    gauge!("proxy_active_bridges").decrement(1.0);
    counter!("proxy_bridge_bytes_total", "direction" => "client_to_upstream")
        .increment(client_to_upstream);
    counter!("proxy_bridge_bytes_total", "direction" => "upstream_to_client")
        .increment(upstream_to_client);
}
