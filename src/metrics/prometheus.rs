//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs executed, labeled by class, queue and status (success/failure).
pub static JOBS_PROCESSED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by class.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs currently being executed by this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Jobs pushed by the client, labeled by queue.
pub static JOBS_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Failed jobs scheduled for another attempt, labeled by class.
pub static JOBS_RETRIED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that exhausted their retries, labeled by class and outcome (dead/discarded).
pub static JOBS_EXHAUSTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs moved from a sorted set back onto a queue, labeled by set.
pub static SCHEDULED_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Queue sizes as last observed, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Store round-trip time measured by the last heartbeat, in microseconds.
pub static HEARTBEAT_RTT_US: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_processed_total = CounterVec::new(
        Opts::new("jobforge_jobs_processed_total", "Total number of jobs executed"),
        &["class", "queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["class"],
    )?;

    let jobs_in_progress = Gauge::new(
        "jobforge_jobs_in_progress",
        "Number of jobs currently being executed",
    )?;

    let jobs_enqueued_total = CounterVec::new(
        Opts::new("jobforge_jobs_enqueued_total", "Total number of jobs pushed"),
        &["queue"],
    )?;

    let jobs_retried_total = CounterVec::new(
        Opts::new(
            "jobforge_jobs_retried_total",
            "Total number of failed jobs scheduled for retry",
        ),
        &["class"],
    )?;

    let jobs_exhausted_total = CounterVec::new(
        Opts::new(
            "jobforge_jobs_exhausted_total",
            "Total number of jobs that used up their retries",
        ),
        &["class", "outcome"],
    )?;

    let scheduled_enqueued_total = CounterVec::new(
        Opts::new(
            "jobforge_scheduled_enqueued_total",
            "Total number of scheduled or retried jobs moved onto queues",
        ),
        &["set"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Number of jobs waiting in a queue"),
        &["queue"],
    )?;

    let heartbeat_rtt_us = Gauge::new(
        "jobforge_heartbeat_rtt_microseconds",
        "Store round-trip time measured by the heartbeat",
    )?;

    registry.register(Box::new(jobs_processed_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(jobs_enqueued_total.clone()))?;
    registry.register(Box::new(jobs_retried_total.clone()))?;
    registry.register(Box::new(jobs_exhausted_total.clone()))?;
    registry.register(Box::new(scheduled_enqueued_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(heartbeat_rtt_us.clone()))?;

    // Already initialized when these fail; the first set stays in use.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_PROCESSED_TOTAL.set(jobs_processed_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = JOBS_ENQUEUED_TOTAL.set(jobs_enqueued_total);
    let _ = JOBS_RETRIED_TOTAL.set(jobs_retried_total);
    let _ = JOBS_EXHAUSTED_TOTAL.set(jobs_exhausted_total);
    let _ = SCHEDULED_ENQUEUED_TOTAL.set(scheduled_enqueued_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = HEARTBEAT_RTT_US.set(heartbeat_rtt_us);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = JOBS_ENQUEUED_TOTAL.get() {
            counter.with_label_values(&["export_test"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("jobforge_jobs_enqueued_total"));
    }
}
