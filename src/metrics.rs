//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Per-item replication outcomes and bytes moved
//! - Cycle outcomes and duration per config
//! - Queue task dispositions
//! - Engine lifecycle state
//!
//! These functions are driven by [`MetricsSink`](crate::completion::MetricsSink);
//! the engine itself only talks to its injected sink.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one item attempt.
pub fn record_item(config_id: &str, operation: &str, status: &str) {
    counter!(
        "replication_items_total",
        "config_id" => config_id.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an item that will not be retried again.
pub fn record_item_terminal(config_id: &str) {
    counter!("replication_items_terminal_total", "config_id" => config_id.to_string()).increment(1);
}

/// Record bytes written to a destination.
pub fn record_bytes(config_id: &str, resource_bytes: u64, metadata_bytes: u64) {
    if resource_bytes > 0 {
        counter!("replication_resource_bytes_total", "config_id" => config_id.to_string())
            .increment(resource_bytes);
    }
    if metadata_bytes > 0 {
        counter!("replication_metadata_bytes_total", "config_id" => config_id.to_string())
            .increment(metadata_bytes);
    }
}

/// Record how many attempts a task needed before it was resolved.
pub fn record_task_attempts(config_id: &str, attempts: u32) {
    histogram!("replication_task_attempts", "config_id" => config_id.to_string()).record(attempts as f64);
}

/// Record a finished cycle leg.
pub fn record_cycle(config_id: &str, direction: &str, status: &str, processed: u64, duration: Duration) {
    counter!(
        "replication_cycles_total",
        "config_id" => config_id.to_string(),
        "direction" => direction.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("replication_cycle_duration_seconds", "config_id" => config_id.to_string())
        .record(duration.as_secs_f64());
    histogram!("replication_cycle_items", "config_id" => config_id.to_string()).record(processed as f64);
}

/// Records handed to a destination queue by a cycle.
pub fn record_enqueued(config_id: &str, count: u64) {
    if count > 0 {
        counter!("replication_tasks_enqueued_total", "config_id" => config_id.to_string()).increment(count);
    }
}

/// Unix time of the last successful cycle, for staleness alerts.
pub fn set_last_success(config_id: &str, unix_seconds: i64) {
    gauge!("replication_last_success_timestamp_seconds", "config_id" => config_id.to_string())
        .set(unix_seconds as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding for alerting.
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}
