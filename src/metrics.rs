/// Metrics and telemetry for Nexus Deploy
///
/// Prometheus-compatible registries for the edge, hub, runner, and executor.
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "nexus_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request latencies in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "nexus_http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// Active WebSocket connections on the hub
    pub static ref WS_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "nexus_websocket_connections_active",
        "Number of active WebSocket connections"
    )
    .unwrap();

    /// Messages received from the pub/sub bus
    pub static ref PUBSUB_MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "nexus_pubsub_messages_received_total",
        "Total number of messages received from the pub/sub bus"
    )
    .unwrap();

    /// Messages fanned out to WebSocket clients
    pub static ref WS_MESSAGES_BROADCAST_TOTAL: IntCounter = register_int_counter!(
        "nexus_websocket_messages_broadcast_total",
        "Total number of messages broadcast to WebSocket clients"
    )
    .unwrap();

    /// Builds accepted by the build service
    pub static ref BUILDS_TRIGGERED_TOTAL: IntCounter = register_int_counter!(
        "nexus_builds_triggered_total",
        "Total number of builds triggered"
    )
    .unwrap();

    /// Deployments currently running
    pub static ref DEPLOYMENTS_ACTIVE: IntGauge = register_int_gauge!(
        "nexus_deployments_active",
        "Number of active deployments"
    )
    .unwrap();
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        BUILDS_TRIGGERED_TOTAL.inc();
        let output = gather();
        assert!(output.contains("nexus_builds_triggered_total"));
    }
}
