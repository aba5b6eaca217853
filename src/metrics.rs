//! Metric helpers
//!
//! Three series, all labelled `{namespace, service}`: processed and
//! failed queue items, and the end-to-end latency of the last processed
//! item.

use crate::error::{CloudError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Record a completed queue item.
pub fn record_processed(namespace: &str, service: &str) {
    counter!(
        "csccm_update_lb_queue_processed_total",
        "namespace" => namespace.to_string(),
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a failed queue item.
pub fn record_failure(namespace: &str, service: &str) {
    counter!(
        "csccm_update_lb_queue_failures_total",
        "namespace" => namespace.to_string(),
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record the end-to-end duration of the last processed item.
pub fn record_item_duration(namespace: &str, service: &str, duration: Duration) {
    gauge!(
        "csccm_update_lb_queue_item_duration_seconds",
        "namespace" => namespace.to_string(),
        "service" => service.to_string()
    )
    .set(duration.as_secs_f64());
}

/// Install the process-wide Prometheus exporter serving `/metrics` on
/// `addr`. Call once from startup, inside the tokio runtime.
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CloudError::Configuration(format!("failed to install exporter: {}", e)))
}
