//! Error types shared across the job runtime.
//!
//! Subsystem-specific errors live next to their subsystem (`StoreError` in
//! `store`, `ClientError` in `client`, `ConfigError` in `config`,
//! `LauncherError` in `launcher`). This module holds the two that cross
//! module boundaries:
//! - Descriptor validation, raised synchronously to whoever builds or pushes a job
//! - Job execution failures, raised by workers and classified by the retry handler

use thiserror::Error;

/// Errors raised while building or validating a job descriptor.
///
/// A job that fails validation is never written to the store.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Job class must be a non-empty string")]
    MissingClass,

    #[error("Job queue must be a non-empty string")]
    MissingQueue,

    #[error("Invalid queue name '{0}': queue names cannot contain whitespace")]
    InvalidQueueName(String),

    #[error("Job args must serialize to a JSON array, got {0}")]
    ArgsNotArray(&'static str),

    #[error("Job args are not JSON-serializable: {0}")]
    UnserializableArgs(String),

    #[error("Scheduled time must be a finite unix timestamp, got {0}")]
    InvalidSchedule(f64),
}

/// Errors raised while executing a job.
///
/// Every variant is caught at the processor boundary and handed to the
/// retry handler; none of them ends the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("No worker registered for job class '{0}'")]
    UnknownClass(String),

    #[error("Job payload is not a valid descriptor: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl JobError {
    /// Short class name recorded as `error_class` on the failed descriptor.
    pub fn class_name(&self) -> &'static str {
        match self {
            JobError::UnknownClass(_) => "UnknownJobClass",
            JobError::InvalidPayload(_) => "InvalidPayload",
            JobError::Panicked(_) => "Panic",
            JobError::Failed(_) => "JobFailed",
        }
    }

    /// Lines recorded as the job's backtrace: the error and each of its causes.
    pub fn backtrace_lines(&self) -> Vec<String> {
        match self {
            JobError::Failed(err) => err.chain().map(|cause| cause.to_string()).collect(),
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidQueueName("my queue".to_string());
        assert!(err.to_string().contains("my queue"));

        let err = ValidationError::ArgsNotArray("object");
        assert!(err.to_string().contains("object"));

        let err = ValidationError::InvalidSchedule(f64::NAN);
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn test_job_error_class_names() {
        assert_eq!(
            JobError::UnknownClass("Missing".to_string()).class_name(),
            "UnknownJobClass"
        );
        assert_eq!(JobError::Panicked("boom".to_string()).class_name(), "Panic");
        assert_eq!(
            JobError::Failed(anyhow::anyhow!("nope")).class_name(),
            "JobFailed"
        );
    }

    #[test]
    fn test_job_error_backtrace_lines_follow_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("fetching invoice");
        let lines = JobError::Failed(err).backtrace_lines();

        assert_eq!(lines, vec!["fetching invoice", "connection refused"]);
    }

    #[test]
    fn test_job_error_transparent_display() {
        let err = JobError::Failed(anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "disk full");
    }
}
