//! Prometheus metrics for the job runtime.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("InvoiceMailer", "mailers", true, 0.42);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    HEARTBEAT_RTT_US, JOBS_ENQUEUED_TOTAL, JOBS_EXHAUSTED_TOTAL, JOBS_IN_PROGRESS,
    JOBS_PROCESSED_TOTAL, JOBS_RETRIED_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY,
    SCHEDULED_ENQUEUED_TOTAL,
};
