//! Middleware feeding the Prometheus collectors.

use std::time::Instant;

use async_trait::async_trait;

use super::{ClientMiddleware, ClientNext, Next, ServerMiddleware};
use crate::client::ClientError;
use crate::error::JobError;
use crate::job::JobDescriptor;
use crate::metrics::MetricsCollector;

/// Records processed/failed counts, durations and the in-progress gauge.
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    collector: MetricsCollector,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerMiddleware for ServerMetrics {
    async fn call(
        &self,
        job: &mut JobDescriptor,
        queue: &str,
        next: Next<'_>,
    ) -> Result<(), JobError> {
        let class = job.class.clone();
        let started = Instant::now();
        self.collector.inc_jobs_in_progress();

        let result = next.run(job, queue).await;

        self.collector.dec_jobs_in_progress();
        self.collector.record_job(
            &class,
            queue,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

/// Counts pushes per destination queue.
#[derive(Debug, Clone, Default)]
pub struct ClientMetrics {
    collector: MetricsCollector,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientMiddleware for ClientMetrics {
    async fn call(
        &self,
        job: JobDescriptor,
        queue: &str,
        next: ClientNext<'_>,
    ) -> Result<Option<JobDescriptor>, ClientError> {
        let pushed = next.run(job, queue).await?;
        if pushed.is_some() {
            self.collector.record_enqueue(queue);
        }
        Ok(pushed)
    }
}
