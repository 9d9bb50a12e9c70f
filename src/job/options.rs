//! Per-class job options.
//!
//! Options are fixed when a worker class is registered and copied onto every
//! descriptor the client builds for that class.

use serde::{Deserialize, Serialize};

use super::descriptor::{BacktracePolicy, JobDescriptor, RetryPolicy, DEFAULT_QUEUE};
use crate::error::ValidationError;

/// Immutable defaults attached to a job class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub queue: String,
    pub retry: RetryPolicy,
    pub backtrace: BacktracePolicy,
    /// When false, exhausted jobs skip the dead set.
    pub dead: bool,
    pub retry_queue: Option<String>,
    pub tags: Vec<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            retry: RetryPolicy::default(),
            backtrace: BacktracePolicy::default(),
            dead: true,
            retry_queue: None,
            tags: Vec::new(),
        }
    }
}

impl JobOptions {
    /// Creates options for the given queue.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_backtrace(mut self, backtrace: BacktracePolicy) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn with_dead(mut self, dead: bool) -> Self {
        self.dead = dead;
        self
    }

    pub fn with_retry_queue(mut self, queue: impl Into<String>) -> Self {
        self.retry_queue = Some(queue.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builds a descriptor for `class` carrying these options.
    pub fn descriptor<A: Serialize>(
        &self,
        class: impl Into<String>,
        args: A,
    ) -> Result<JobDescriptor, ValidationError> {
        let mut job = JobDescriptor::new(class, args)?
            .with_queue(self.queue.clone())
            .with_retry(self.retry)
            .with_backtrace(self.backtrace);
        job.retry_queue = self.retry_queue.clone();
        job.tags = self.tags.clone();
        if !self.dead {
            job.dead = Some(false);
        }
        Ok(job)
    }
}
