//! Failure handling: retry scheduling, the dead set and death handlers.
//!
//! | `retry` | on failure |
//! |---|---|
//! | `false` | death handlers run, job discarded |
//! | `true` | retried up to the runtime's `max_retries` |
//! | `N` | retried up to N times |
//!
//! A job past its limit is handed to the worker's `retries_exhausted` hook,
//! added to the dead set (unless `dead: false`) and passed to every death
//! handler.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::JobError;
use crate::job::{JobDescriptor, Worker};
use crate::metrics::MetricsCollector;
use crate::store::{keys, Store, StoreError};

/// Longest error message stored on a failed job.
const MAX_ERROR_MESSAGE_LEN: usize = 10_000;

/// Errors raised while recording a failure.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backtrace compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Backtrace is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// What happened to a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Added to the retry set, due at `at`.
    Scheduled { retry_count: u32, at: f64 },
    /// Retries exhausted; moved to the dead set.
    Dead,
    /// Not retried and not kept.
    Discarded,
}

/// Called for every job that will not run again.
#[async_trait]
pub trait DeathHandler: Send + Sync {
    async fn on_death(&self, job: &JobDescriptor, error: &JobError);
}

/// Limits applied to the dead set on every insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadSetLimits {
    pub max_jobs: usize,
    pub timeout: Duration,
}

impl Default for DeadSetLimits {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            timeout: Duration::from_secs(180 * 24 * 60 * 60),
        }
    }
}

/// Records job failures in the store.
#[derive(Clone)]
pub struct RetryHandler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    dead_limits: DeadSetLimits,
    death_handlers: Arc<Vec<Arc<dyn DeathHandler>>>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("max_retries", &self.max_retries)
            .field("dead_limits", &self.dead_limits)
            .field("death_handlers", &self.death_handlers.len())
            .finish_non_exhaustive()
    }
}

impl RetryHandler {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
        dead_limits: DeadSetLimits,
        death_handlers: Arc<Vec<Arc<dyn DeathHandler>>>,
    ) -> Self {
        Self {
            store,
            clock,
            max_retries,
            dead_limits,
            death_handlers,
            metrics: MetricsCollector::new(),
        }
    }

    /// Records a failed execution of `job` (as it was fetched from `queue`).
    pub async fn handle(
        &self,
        mut job: JobDescriptor,
        queue: &str,
        error: &JobError,
        worker: Option<&dyn Worker>,
    ) -> Result<RetryOutcome, RetryError> {
        let Some(max_attempts) = job.retry.max_attempts(self.max_retries) else {
            debug!(jid = %job.jid, "Retries disabled, discarding failed job");
            self.run_death_handlers(&job, error).await;
            self.metrics.record_exhausted(&job.class, false);
            return Ok(RetryOutcome::Discarded);
        };

        let now = self.clock.now();
        job.queue = job.retry_queue.clone().unwrap_or_else(|| queue.to_string());
        job.error_message = Some(truncate(&error.to_string(), MAX_ERROR_MESSAGE_LEN));
        job.error_class = Some(error.class_name().to_string());

        let retry_count = match job.retry_count {
            Some(previous) => {
                job.retried_at = Some(now);
                previous.saturating_add(1)
            }
            None => {
                job.failed_at = Some(now);
                0
            }
        };
        job.retry_count = Some(retry_count);

        if let Some(limit) = job.backtrace.line_limit() {
            let lines: Vec<String> = error.backtrace_lines().into_iter().take(limit).collect();
            job.error_backtrace = Some(compress_backtrace(&lines)?);
        }

        if retry_count < max_attempts {
            let delay = worker
                .and_then(|w| w.retry_in(retry_count, error))
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(|| default_backoff(retry_count));
            let at = now + delay;

            self.store
                .add_to_set(keys::RETRY, at, &job.to_json()?)
                .await?;
            self.metrics.record_retry(&job.class);
            info!(
                jid = %job.jid,
                class = %job.class,
                retry_count,
                delay_secs = delay,
                "Scheduled job retry"
            );
            return Ok(RetryOutcome::Scheduled { retry_count, at });
        }

        if let Some(worker) = worker {
            worker.retries_exhausted(&job, error).await;
        }

        let killed = job.dead != Some(false);
        if killed {
            self.kill(&job).await?;
        }
        warn!(
            jid = %job.jid,
            class = %job.class,
            retry_count,
            dead = killed,
            "Job retries exhausted"
        );
        self.metrics.record_exhausted(&job.class, killed);
        self.run_death_handlers(&job, error).await;

        Ok(if killed {
            RetryOutcome::Dead
        } else {
            RetryOutcome::Discarded
        })
    }

    /// Adds a job to the dead set, trimming it.
    pub async fn kill(&self, job: &JobDescriptor) -> Result<(), RetryError> {
        self.kill_payload(&job.to_json()?).await?;
        Ok(())
    }

    /// Adds a raw payload to the dead set, used for payloads that do not parse.
    pub async fn kill_payload(&self, payload: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expire_before = now - self.dead_limits.timeout.as_secs_f64();
        self.store
            .kill(payload, now, expire_before, self.dead_limits.max_jobs)
            .await
    }

    async fn run_death_handlers(&self, job: &JobDescriptor, error: &JobError) {
        for handler in self.death_handlers.iter() {
            handler.on_death(job, error).await;
        }
    }
}

/// Seconds before retry number `count` (0-based):
/// `count⁴ + 15 + rand(0..10) × (count + 1)`.
pub fn default_backoff(count: u32) -> f64 {
    let jitter: u32 = rand::rng().random_range(0..10);
    backoff_with_jitter(count, jitter)
}

fn backoff_with_jitter(count: u32, jitter: u32) -> f64 {
    let count = f64::from(count);
    count.powi(4) + 15.0 + f64::from(jitter) * (count + 1.0)
}

/// Encodes backtrace lines as JSON, zlib-compressed and base64-encoded.
pub fn compress_backtrace(lines: &[String]) -> Result<String, RetryError> {
    let json = serde_json::to_vec(lines)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Reverses [`compress_backtrace`].
pub fn decompress_backtrace(encoded: &str) -> Result<Vec<String>, RetryError> {
    let compressed = STANDARD.decode(encoded)?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

fn truncate(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
