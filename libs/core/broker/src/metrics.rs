//! Metrics module for worker and queue observability.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! worker performance, health, and queue pressure.
//!
//! ## Available Metrics
//!
//! - `worker_jobs_processed_total` - Counter of jobs processed by status
//! - `worker_job_duration_seconds` - Histogram of job processing time
//! - `worker_queue_depth` - Gauge of raw stream length
//! - `worker_queue_pending` / `worker_queue_true_depth` - queue-metrics (§4.C)
//! - `worker_errors_total` - Counter of errors by type
//! - `worker_retries_total` - Counter of retry attempts
//! - `worker_consumer_lag` - Gauge of consumer group lag

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency, per §6/§10.
pub mod names {
    pub const JOBS_PROCESSED: &str = "worker_jobs_processed_total";
    pub const JOBS_FAILED: &str = "worker_jobs_failed_total";
    pub const JOB_DURATION: &str = "worker_job_duration_seconds";
    pub const QUEUE_DEPTH: &str = "worker_queue_depth";
    pub const QUEUE_PENDING: &str = "worker_queue_pending";
    pub const QUEUE_OLDEST_PENDING_AGE_MS: &str = "worker_queue_oldest_pending_age_ms";
    pub const QUEUE_TRUE_DEPTH: &str = "worker_queue_true_depth";
    pub const ERRORS: &str = "worker_errors_total";
    pub const RETRIES: &str = "worker_retries_total";
    pub const CONSUMER_LAG: &str = "worker_consumer_lag";
    pub const BATCH_SIZE: &str = "worker_batch_size";
    pub const DLQ_SIZE: &str = "worker_dlq_size";
    /// Current number of jobs being processed concurrently
    pub const IN_FLIGHT_JOBS: &str = "worker_in_flight_jobs";
    pub const UPTIME_SECONDS: &str = "worker_uptime_seconds";
    pub const STATE: &str = "worker_state";
    pub const MEMORY_BYTES: &str = "worker_memory_bytes";
    pub const CPU_PERCENT: &str = "worker_cpu_percent";
}

/// Job processing status for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum JobStatus {
    Success,
    Failed,
    Dlq,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::Skipped => "skipped",
        }
    }
}

/// Error category for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum ErrorType {
    Transient,
    Permanent,
    RateLimited,
    Validation,
    Connection,
    Timeout,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle.
///
/// Returns None if metrics haven't been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a job as processed with the given status.
pub fn record_job_processed(queue: &str, status: JobStatus) {
    counter!(
        names::JOBS_PROCESSED,
        "queue" => queue.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);

    if matches!(status, JobStatus::Failed | JobStatus::Dlq) {
        counter!(names::JOBS_FAILED, "queue" => queue.to_string()).increment(1);
    }
}

/// Record job processing duration.
pub fn record_job_duration(queue: &str, operation: &str, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "queue" => queue.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the raw stream length gauge.
pub fn set_queue_depth(queue: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "queue" => queue.to_string()
    )
    .set(depth);
}

/// Update the §4.C queue-metrics gauges for a `(queue, group)` pair.
pub fn set_queue_true_depth(queue: &str, pending: f64, oldest_pending_age_ms: f64, true_depth: f64) {
    gauge!(names::QUEUE_PENDING, "queue" => queue.to_string()).set(pending);
    gauge!(names::QUEUE_OLDEST_PENDING_AGE_MS, "queue" => queue.to_string())
        .set(oldest_pending_age_ms);
    gauge!(names::QUEUE_TRUE_DEPTH, "queue" => queue.to_string()).set(true_depth);
}

/// Record an error by type.
pub fn record_error(queue: &str, error_type: ErrorType) {
    counter!(
        names::ERRORS,
        "queue" => queue.to_string(),
        "error_type" => error_type.as_str().to_string()
    )
    .increment(1);
}

/// Record a retry attempt.
pub fn record_retry(queue: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Update the consumer lag gauge.
pub fn set_consumer_lag(queue: &str, consumer_group: &str, lag: f64) {
    gauge!(
        names::CONSUMER_LAG,
        "queue" => queue.to_string(),
        "consumer_group" => consumer_group.to_string()
    )
    .set(lag);
}

/// Record the batch size processed.
pub fn record_batch_size(queue: &str, size: usize) {
    histogram!(
        names::BATCH_SIZE,
        "queue" => queue.to_string()
    )
    .record(size as f64);
}

/// Update the DLQ size gauge.
pub fn set_dlq_size(queue: &str, size: f64) {
    gauge!(
        names::DLQ_SIZE,
        "queue" => queue.to_string()
    )
    .set(size);
}

/// Update the in-flight jobs gauge (concurrent processing).
pub fn set_in_flight_jobs(queue: &str, count: f64) {
    gauge!(
        names::IN_FLIGHT_JOBS,
        "queue" => queue.to_string()
    )
    .set(count);
}

/// Set the worker-level gauges read by `/metrics`, labelled per §6.
pub fn set_worker_gauges(worker_id: &str, class: &str, state: &str, uptime_seconds: f64) {
    gauge!(
        names::UPTIME_SECONDS,
        "worker_id" => worker_id.to_string(),
        "class" => class.to_string()
    )
    .set(uptime_seconds);

    // `state` is encoded as a set of 0/1 gauges, one per known state value,
    // since Prometheus gauges cannot carry string values directly.
    for candidate in ["idle", "waiting", "busy", "error", "shutdown"] {
        gauge!(
            names::STATE,
            "worker_id" => worker_id.to_string(),
            "class" => class.to_string(),
            "value" => candidate.to_string()
        )
        .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// Helper struct for timing operations and recording metrics.
pub struct MetricsTimer {
    queue: String,
    operation: String,
    start: std::time::Instant,
}

impl MetricsTimer {
    /// Start a new timer for the given queue and operation.
    pub fn new(queue: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            operation: operation.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Stop the timer and record the duration.
    pub fn stop(self) {
        let duration = self.start.elapsed();
        record_job_duration(&self.queue, &self.operation, duration);
    }

    /// Get elapsed time without stopping.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        // Auto-record on drop if not manually stopped
        let duration = self.start.elapsed();
        record_job_duration(&self.queue, &self.operation, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_as_str() {
        assert_eq!(JobStatus::Success.as_str(), "success");
        assert_eq!(JobStatus::Failed.as_str(), "failed");
        assert_eq!(JobStatus::Dlq.as_str(), "dlq");
        assert_eq!(JobStatus::Skipped.as_str(), "skipped");
    }

    #[test]
    fn test_error_type_as_str() {
        assert_eq!(ErrorType::Transient.as_str(), "transient");
        assert_eq!(ErrorType::Permanent.as_str(), "permanent");
        assert_eq!(ErrorType::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorType::Validation.as_str(), "validation");
        assert_eq!(ErrorType::Connection.as_str(), "connection");
        assert_eq!(ErrorType::Timeout.as_str(), "timeout");
        assert_eq!(ErrorType::Unknown.as_str(), "unknown");
    }

    #[test]
    fn test_metrics_timer() {
        let timer = MetricsTimer::new("test_queue", "test_op");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed().as_millis() >= 10);
    }
}
