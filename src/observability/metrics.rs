//! Metrics collection and exposition.
//!
//! # Metrics
//! - `toolguard_commands_total` (counter): subprocess outcomes
//! - `toolguard_path_violations_total` (counter): rejected paths by kind
//! - `toolguard_auth_total` (counter): authentication outcomes by method
//! - `toolguard_client_blocks_total` (counter): failure-limiter blocks by category
//! - `toolguard_operations_total` (counter) / `toolguard_operation_duration_seconds`
//!   (histogram): governed operations by type and outcome
//! - `toolguard_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `toolguard_active_operations` / `toolguard_active_connections` (gauges)
//! - `toolguard_channel_rejections_total` (counter): channel rejections by reason
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Label values are small closed sets, except operation type

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_command(outcome: &'static str) {
    counter!("toolguard_commands_total", "outcome" => outcome).increment(1);
}

pub fn record_path_violation(kind: &'static str) {
    counter!("toolguard_path_violations_total", "kind" => kind).increment(1);
}

pub fn record_auth(method: &'static str, outcome: &'static str) {
    counter!("toolguard_auth_total", "method" => method, "outcome" => outcome).increment(1);
}

pub fn record_client_block(category: &str) {
    counter!("toolguard_client_blocks_total", "category" => category.to_string()).increment(1);
}

pub fn record_operation(op_type: &str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "toolguard_operations_total",
        "op_type" => op_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("toolguard_operation_duration_seconds", "op_type" => op_type.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_circuit_state(op_type: &str, state_value: f64) {
    gauge!("toolguard_circuit_state", "op_type" => op_type.to_string()).set(state_value);
}

pub fn set_active_operations(count: usize) {
    gauge!("toolguard_active_operations").set(count as f64);
}

pub fn set_active_connections(count: usize) {
    gauge!("toolguard_active_connections").set(count as f64);
}

pub fn record_channel_rejection(reason: &'static str) {
    counter!("toolguard_channel_rejections_total", "reason" => reason).increment(1);
}
