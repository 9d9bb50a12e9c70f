//! Job classes available to `jobforge run` out of the box.
//!
//! These exist so a fresh deployment can be smoke-tested end to end with
//! `jobforge enqueue`; real applications register their own workers.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::info;

use crate::job::{JobDescriptor, JobOptions, JobRegistry, Worker};

pub const ECHO: &str = "Echo";
pub const SLEEP: &str = "Sleep";
pub const FAIL: &str = "Fail";

/// Logs its arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoJob;

#[async_trait]
impl Worker for EchoJob {
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        info!(jid = %job.jid, args = %serde_json::Value::from(job.args.clone()), "echo");
        Ok(())
    }
}

/// Sleeps for `args[0]` seconds (fractions allowed).
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepJob;

#[async_trait]
impl Worker for SleepJob {
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        let secs = job
            .args
            .first()
            .and_then(serde_json::Value::as_f64)
            .context("Sleep expects a number of seconds as its first argument")?;
        if !(secs.is_finite() && secs >= 0.0) {
            bail!("Sleep duration must be a non-negative number, got {secs}");
        }
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(())
    }
}

/// Always fails, with `args[0]` as the message when it is a string.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailJob;

#[async_trait]
impl Worker for FailJob {
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        let message = job
            .args
            .first()
            .and_then(serde_json::Value::as_str)
            .unwrap_or("requested failure");
        bail!("{message}")
    }
}

/// Registry holding the built-in classes with default options.
pub fn builtin_registry() -> JobRegistry {
    JobRegistry::new()
        .with(ECHO, JobOptions::default(), EchoJob)
        .with(SLEEP, JobOptions::default(), SleepJob)
        .with(FAIL, JobOptions::default(), FailJob)
}
