//! Client and server middleware chains.
//!
//! Both chains are onions: middleware run in registration order on the way
//! in and unwind in reverse on the way out. Each middleware receives a
//! `next` handle and decides whether (and when) to call it.
//!
//! - A server middleware that does not call `next` skips the job; the job
//!   still counts as processed.
//! - A client middleware that does not call `next` (returns `Ok(None)`)
//!   suppresses the push.

pub mod logging;
pub mod metrics;

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ClientError;
use crate::error::JobError;
use crate::job::{JobDescriptor, Worker};

pub use self::logging::JobLogger;
pub use self::metrics::{ClientMetrics, ServerMetrics};

/// Middleware wrapped around every job execution.
#[async_trait]
pub trait ServerMiddleware: Send + Sync {
    async fn call(
        &self,
        job: &mut JobDescriptor,
        queue: &str,
        next: Next<'_>,
    ) -> Result<(), JobError>;
}

/// The rest of a server chain, ending in the worker.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn ServerMiddleware>],
    worker: &'a dyn Worker,
}

impl Next<'_> {
    /// Runs the remaining middleware and then the worker.
    pub async fn run(self, job: &mut JobDescriptor, queue: &str) -> Result<(), JobError> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    remaining: rest,
                    worker: self.worker,
                };
                current.call(job, queue, next).await
            }
            None => self.worker.perform(job).await.map_err(JobError::Failed),
        }
    }
}

/// Ordered server middleware.
#[derive(Clone, Default)]
pub struct ServerChain {
    entries: Vec<Arc<dyn ServerMiddleware>>,
}

impl ServerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; it runs after those already registered.
    pub fn add(&mut self, middleware: impl ServerMiddleware + 'static) -> &mut Self {
        self.entries.push(Arc::new(middleware));
        self
    }

    pub fn with(mut self, middleware: impl ServerMiddleware + 'static) -> Self {
        self.add(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs `job` through every middleware and finally `worker`.
    pub async fn invoke(
        &self,
        job: &mut JobDescriptor,
        queue: &str,
        worker: &dyn Worker,
    ) -> Result<(), JobError> {
        let next = Next {
            remaining: &self.entries,
            worker,
        };
        next.run(job, queue).await
    }
}

impl std::fmt::Debug for ServerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChain")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Middleware wrapped around every push.
#[async_trait]
pub trait ClientMiddleware: Send + Sync {
    /// Returns the (possibly modified) job to push, or `None` to suppress it.
    async fn call(
        &self,
        job: JobDescriptor,
        queue: &str,
        next: ClientNext<'_>,
    ) -> Result<Option<JobDescriptor>, ClientError>;
}

/// The rest of a client chain.
pub struct ClientNext<'a> {
    remaining: &'a [Arc<dyn ClientMiddleware>],
}

impl ClientNext<'_> {
    pub async fn run(
        self,
        job: JobDescriptor,
        queue: &str,
    ) -> Result<Option<JobDescriptor>, ClientError> {
        match self.remaining.split_first() {
            Some((current, rest)) => current.call(job, queue, ClientNext { remaining: rest }).await,
            None => Ok(Some(job)),
        }
    }
}

/// Ordered client middleware.
#[derive(Clone, Default)]
pub struct ClientChain {
    entries: Vec<Arc<dyn ClientMiddleware>>,
}

impl ClientChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: impl ClientMiddleware + 'static) -> &mut Self {
        self.entries.push(Arc::new(middleware));
        self
    }

    pub fn with(mut self, middleware: impl ClientMiddleware + 'static) -> Self {
        self.add(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn invoke(
        &self,
        job: JobDescriptor,
        queue: &str,
    ) -> Result<Option<JobDescriptor>, ClientError> {
        ClientNext {
            remaining: &self.entries,
        }
        .run(job, queue)
        .await
    }
}

impl std::fmt::Debug for ClientChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChain")
            .field("len", &self.entries.len())
            .finish()
    }
}
