//! Prometheus metrics for queue workers
//!
//! Recording goes through the `metrics` facade and never fails; without an
//! installed recorder the calls are no-ops.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Metric labels for one worker on one connection
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    connection: String,
    worker: String,
}

impl QueueMetrics {
    pub fn new(connection: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            worker: worker.into(),
        }
    }

    /// Every executed job, whatever the outcome
    pub fn job_executed(&self, queue: &str, job_type: &str, status: &'static str, duration: Duration) {
        counter!(
            "queue_worker_jobs_processed_total",
            "connection" => self.connection.clone(),
            "worker" => self.worker.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "queue_worker_job_duration_seconds",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Resident memory growth across one job, in bytes
    pub fn memory_delta(&self, queue: &str, bytes: i64) {
        histogram!(
            "queue_worker_job_memory_delta_bytes",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string()
        )
        .record(bytes as f64);
    }

    pub fn job_retried(&self, queue: &str, job_type: &str) {
        counter!(
            "queue_worker_jobs_retried_total",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Rescheduled without consuming an attempt
    pub fn job_released(&self, queue: &str, job_type: &str) {
        counter!(
            "queue_worker_jobs_released_total",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_timed_out(&self, queue: &str, job_type: &str) {
        counter!(
            "queue_worker_jobs_timed_out_total",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Permanently failed and stored
    pub fn job_failed(&self, queue: &str, job_type: &str, class: &str) {
        counter!(
            "queue_worker_jobs_failed_total",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    pub fn poll_error(&self, queue: &str) {
        counter!(
            "queue_worker_poll_errors_total",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    pub fn queue_depth(&self, queue: &str, depth: u64) {
        gauge!(
            "queue_worker_queue_depth",
            "connection" => self.connection.clone(),
            "queue" => queue.to_string()
        )
        .set(depth as f64);
    }

    pub fn resident_memory(&self, bytes: u64) {
        gauge!(
            "queue_worker_resident_memory_bytes",
            "worker" => self.worker.clone()
        )
        .set(bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = QueueMetrics::new("memory", "test");
        metrics.job_executed("default", "noop", "success", Duration::from_millis(5));
        metrics.job_failed("default", "noop", "RuntimeError");
        metrics.queue_depth("default", 3);
        assert_eq!(metrics.connection, "memory");
    }
}
