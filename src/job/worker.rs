//! The trait implemented by job classes.

use std::time::Duration;

use async_trait::async_trait;

use super::descriptor::JobDescriptor;
use crate::error::JobError;

/// Code executed for one job class.
///
/// Implementations are shared across all processors, so `perform` takes
/// `&self` and must be safe to call concurrently.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Runs the job. Any error (or panic) hands the job to the retry handler.
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()>;

    /// Called once when a job of this class has used up all its retries.
    async fn retries_exhausted(&self, _job: &JobDescriptor, _error: &JobError) {}

    /// Custom delay before retry number `count`. `None` uses the default backoff.
    fn retry_in(&self, _count: u32, _error: &JobError) -> Option<Duration> {
        None
    }
}
