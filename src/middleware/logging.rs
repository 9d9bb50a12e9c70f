//! Per-job structured logging.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, info_span, warn, Instrument};

use super::{Next, ServerMiddleware};
use crate::error::JobError;
use crate::job::JobDescriptor;

/// Wraps each job in a `job` span and logs start, done and fail lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobLogger;

#[async_trait]
impl ServerMiddleware for JobLogger {
    async fn call(
        &self,
        job: &mut JobDescriptor,
        queue: &str,
        next: Next<'_>,
    ) -> Result<(), JobError> {
        let span = info_span!(
            "job",
            class = %job.class,
            jid = %job.jid,
            queue = %queue,
            retry_count = job.retry_count,
        );

        async move {
            let started = Instant::now();
            info!("start");

            let result = next.run(job, queue).await;
            let elapsed = started.elapsed().as_secs_f64();

            match &result {
                Ok(()) => info!(elapsed, "done"),
                Err(e) => warn!(elapsed, error = %e, "fail"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::job::Worker;
    use crate::middleware::ServerChain;

    struct Succeeds;

    #[async_trait]
    impl Worker for Succeeds {
        async fn perform(&self, _job: &JobDescriptor) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Worker for Broken {
        async fn perform(&self, _job: &JobDescriptor) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    #[tokio::test]
    async fn test_logger_is_transparent() {
        let chain = ServerChain::new().with(JobLogger);
        let mut job = JobDescriptor::new("Mailer", [1]).expect("valid job");

        assert!(chain.invoke(&mut job, "default", &Succeeds).await.is_ok());

        let err = chain
            .invoke(&mut job, "default", &Broken)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "smtp unavailable");
    }
}
