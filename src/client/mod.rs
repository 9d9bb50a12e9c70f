//! The enqueuer.
//!
//! [`Client::push`] normalizes a descriptor (job id, `created_at`), validates
//! it, runs the client middleware chain and writes it with one store round
//! trip: jobs due in the future go to the `schedule` set, everything else
//! onto its queue with `enqueued_at` set.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::ValidationError;
use crate::job::{generate_jid, JobDescriptor, JobRegistry};
use crate::middleware::ClientChain;
use crate::store::{Push, Store, StoreError};

/// Jobs written per round trip by [`Client::push_bulk`] unless told otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Errors that can occur while pushing jobs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The descriptor is invalid; nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store rejected the write.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The descriptor could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `push_bulk` was called with a batch size of zero.
    #[error("Batch size must be greater than 0")]
    InvalidBatchSize,

    /// A client middleware aborted the push.
    #[error("Client middleware failed: {0}")]
    Middleware(String),
}

/// Pushes jobs to the shared store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
    middleware: Arc<ClientChain>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("store", &self.store)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client with no middleware, no registered classes and the
    /// system clock.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            middleware: Arc::new(ClientChain::new()),
            registry: Arc::new(JobRegistry::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<ClientChain>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Uses `registry` to resolve per-class options in `perform_*`.
    pub fn with_registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Pushes one job.
    ///
    /// Returns the job id, or `None` when a client middleware suppressed the
    /// push.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Validation` before anything is written when the
    /// descriptor is invalid, and `ClientError::Store` when the write fails.
    pub async fn push(&self, job: JobDescriptor) -> Result<Option<String>, ClientError> {
        let now = self.clock.now();
        let Some((jid, push)) = self.prepare(job, now).await? else {
            return Ok(None);
        };

        self.store.push(std::slice::from_ref(&push)).await?;
        Ok(Some(jid))
    }

    /// Pushes many jobs, `batch_size` per store round trip.
    ///
    /// Job ids are returned in input order, `None` for suppressed jobs. When
    /// a batch fails the error is returned at once; earlier batches stay
    /// pushed.
    pub async fn push_bulk(
        &self,
        jobs: Vec<JobDescriptor>,
        batch_size: usize,
    ) -> Result<Vec<Option<String>>, ClientError> {
        if batch_size == 0 {
            return Err(ClientError::InvalidBatchSize);
        }

        let now = self.clock.now();
        let mut jids = Vec::with_capacity(jobs.len());
        let mut pending = jobs.into_iter().peekable();

        while pending.peek().is_some() {
            let mut pushes = Vec::with_capacity(batch_size);
            for job in pending.by_ref().take(batch_size) {
                match self.prepare(job, now).await? {
                    Some((jid, push)) => {
                        jids.push(Some(jid));
                        pushes.push(push);
                    }
                    None => jids.push(None),
                }
            }

            if !pushes.is_empty() {
                self.store.push(&pushes).await?;
                debug!(count = pushes.len(), "Pushed job batch");
            }
        }

        Ok(jids)
    }

    /// Pushes a job for `class` using its registered options.
    pub async fn perform_async<A: Serialize>(
        &self,
        class: &str,
        args: A,
    ) -> Result<Option<String>, ClientError> {
        let job = self.registry.options_for(class).descriptor(class, args)?;
        self.push(job).await
    }

    /// Schedules a job for `class` to run after `delay`.
    pub async fn perform_in<A: Serialize>(
        &self,
        delay: Duration,
        class: &str,
        args: A,
    ) -> Result<Option<String>, ClientError> {
        let at = self.clock.now() + delay.as_secs_f64();
        self.perform_at(at, class, args).await
    }

    /// Schedules a job for `class` to run at `at` (unix seconds).
    pub async fn perform_at<A: Serialize>(
        &self,
        at: f64,
        class: &str,
        args: A,
    ) -> Result<Option<String>, ClientError> {
        let job = self
            .registry
            .options_for(class)
            .descriptor(class, args)?
            .with_at(at);
        self.push(job).await
    }

    /// Normalizes, validates and runs middleware; returns the job id and
    /// the store write, or `None` when suppressed.
    async fn prepare(
        &self,
        mut job: JobDescriptor,
        now: f64,
    ) -> Result<Option<(String, Push)>, ClientError> {
        if job.jid.is_empty() {
            job.jid = generate_jid();
        }
        job.created_at.get_or_insert(now);
        job.validate()?;

        let queue = job.queue.clone();
        let Some(job) = self.middleware.invoke(job, &queue).await? else {
            debug!(queue = %queue, "Push suppressed by client middleware");
            return Ok(None);
        };
        job.validate()?;

        let jid = job.jid.clone();
        Ok(Some((jid, into_push(job, now)?)))
    }
}

/// Routes a validated job: future `at` → schedule set, otherwise its queue.
fn into_push(mut job: JobDescriptor, now: f64) -> Result<Push, ClientError> {
    match job.at.take() {
        Some(at) if at > now => {
            job.enqueued_at = None;
            Ok(Push::Schedule {
                at,
                payload: job.to_json()?,
            })
        }
        _ => {
            job.enqueued_at = Some(now);
            Ok(Push::Queue {
                queue: job.queue.clone(),
                payload: job.to_json()?,
            })
        }
    }
}
