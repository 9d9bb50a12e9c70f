//! High-level interface for recording runtime metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    HEARTBEAT_RTT_US, JOBS_ENQUEUED_TOTAL, JOBS_EXHAUSTED_TOTAL, JOBS_IN_PROGRESS,
    JOBS_PROCESSED_TOTAL, JOBS_RETRIED_TOTAL, JOB_DURATION, QUEUE_DEPTH,
    SCHEDULED_ENQUEUED_TOTAL,
};

/// Metrics collector for recording job runtime metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one finished job execution.
    pub fn record_job(&self, class: &str, queue: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(processed) = JOBS_PROCESSED_TOTAL.get() {
            processed.with_label_values(&[class, queue, status]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration.with_label_values(&[class]).observe(duration_secs);
        }

        tracing::trace!(
            class = class,
            queue = queue,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }

    /// Record a job pushed onto `queue` (or the schedule set).
    pub fn record_enqueue(&self, queue: &str) {
        if let Some(enqueued) = JOBS_ENQUEUED_TOTAL.get() {
            enqueued.with_label_values(&[queue]).inc();
        }
    }

    pub fn record_retry(&self, class: &str) {
        if let Some(retried) = JOBS_RETRIED_TOTAL.get() {
            retried.with_label_values(&[class]).inc();
        }
    }

    /// Record a job that ran out of retries; `killed` is false when it was discarded.
    pub fn record_exhausted(&self, class: &str, killed: bool) {
        let outcome = if killed { "dead" } else { "discarded" };
        if let Some(exhausted) = JOBS_EXHAUSTED_TOTAL.get() {
            exhausted.with_label_values(&[class, outcome]).inc();
        }
    }

    /// Record jobs moved from `set` back onto their queues.
    pub fn record_scheduled_enqueue(&self, set: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(scheduled) = SCHEDULED_ENQUEUED_TOTAL.get() {
            scheduled.with_label_values(&[set]).inc_by(count as f64);
        }
    }

    /// Update the observed size of a queue.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    pub fn record_heartbeat_rtt(&self, rtt_us: u64) {
        if let Some(rtt) = HEARTBEAT_RTT_US.get() {
            rtt.set(rtt_us as f64);
        }
    }
}
