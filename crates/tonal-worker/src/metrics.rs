//! Prometheus metrics for the orchestrator.

use std::net::{Ipv4Addr, SocketAddr};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start serving `/metrics` on the given port.
///
/// Without this call the recording functions below are no-ops.
pub fn install_exporter(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const TASKS_DISPATCHED_TOTAL: &str = "tonal_tasks_dispatched_total";
    pub const TASKS_COMPLETED_TOTAL: &str = "tonal_tasks_completed_total";
    pub const TASKS_FAILED_TOTAL: &str = "tonal_tasks_failed_total";
    pub const TASKS_PERMANENTLY_FAILED_TOTAL: &str = "tonal_tasks_permanently_failed_total";
    pub const BATCH_DURATION_SECONDS: &str = "tonal_batch_duration_seconds";

    pub const POOL_WORKERS: &str = "tonal_pool_workers";
    pub const POOL_RECREATIONS_TOTAL: &str = "tonal_pool_recreations_total";

    pub const TASKS_RECLAIMED_TOTAL: &str = "tonal_tasks_reclaimed_total";
    pub const LOOP_ERRORS_TOTAL: &str = "tonal_loop_errors_total";
}

pub fn record_tasks_dispatched(count: usize) {
    counter!(names::TASKS_DISPATCHED_TOTAL).increment(count as u64);
}

pub fn record_task_completed() {
    counter!(names::TASKS_COMPLETED_TOTAL).increment(1);
}

/// Record a task failure; `reason` is `error` or `timeout`.
pub fn record_task_failed(reason: &'static str) {
    counter!(names::TASKS_FAILED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_task_permanently_failed() {
    counter!(names::TASKS_PERMANENTLY_FAILED_TOTAL).increment(1);
}

pub fn record_batch_duration(duration_secs: f64) {
    histogram!(names::BATCH_DURATION_SECONDS).record(duration_secs);
}

pub fn set_pool_workers(count: usize) {
    gauge!(names::POOL_WORKERS).set(count as f64);
}

pub fn record_pool_recreated() {
    counter!(names::POOL_RECREATIONS_TOTAL).increment(1);
}

/// Record reclaimed tasks; `sweep` is `stale` or `failed`.
pub fn record_tasks_reclaimed(sweep: &'static str, count: u64) {
    if count > 0 {
        counter!(names::TASKS_RECLAIMED_TOTAL, "sweep" => sweep).increment(count);
    }
}

pub fn record_loop_error(kind: &'static str) {
    counter!(names::LOOP_ERRORS_TOTAL, "kind" => kind).increment(1);
}
