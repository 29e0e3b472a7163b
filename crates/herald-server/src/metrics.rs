//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use herald_core::DeliveryReport;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const RECIPIENT_TAGS_ACTIVE: &str = "herald_recipient_tags_active";
    pub const MESSAGES_TOTAL: &str = "herald_messages_total";
    pub const MESSAGES_BYTES: &str = "herald_messages_bytes";
    pub const DELIVERIES_TOTAL: &str = "herald_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "herald_delivery_failures_total";
    pub const BROADCAST_SECONDS: &str = "herald_broadcast_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(
        names::RECIPIENT_TAGS_ACTIVE,
        "Current number of distinct recipient tags"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Notifications handed to a connection's outbound queue"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Notifications that could not be handed to a matched connection"
    );
    metrics::describe_histogram!(names::BROADCAST_SECONDS, "Broadcast latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Update the distinct recipient tag count.
pub fn set_active_tags(count: usize) {
    gauge!(names::RECIPIENT_TAGS_ACTIVE).set(count as f64);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record the outcome of a broadcast.
pub fn record_delivery(report: &DeliveryReport) {
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    for failure in &report.failures {
        counter!(names::DELIVERY_FAILURES_TOTAL, "reason" => failure.reason.to_string())
            .increment(1);
    }
}

/// Record broadcast latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::BROADCAST_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{DeliveryError, DeliveryFailure, SessionId};

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic.
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_record_delivery_without_recorder() {
        let report = DeliveryReport {
            matched: 2,
            delivered: 1,
            failures: vec![DeliveryFailure {
                session: SessionId::new("s1"),
                reason: DeliveryError::Closed,
            }],
        };
        record_delivery(&report);
    }
}
