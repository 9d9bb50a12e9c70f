//! A single processor task: fetch, execute, record, repeat.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::fetch::{BasicFetch, UnitOfWork};
use super::retry::RetryHandler;
use crate::error::JobError;
use crate::job::{JobDescriptor, Worker};
use crate::launcher::{RuntimeContext, WorkEntry};

/// Pause after a failed fetch before trying again.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The unit of work a processor holds between fetch and completion.
///
/// Read by the manager when the processor is abandoned at shutdown.
pub type WorkSlot = Arc<Mutex<Option<UnitOfWork>>>;

/// Outcome of one processed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Succeeded,
    Failed,
    /// The payload did not parse and was moved to the dead set.
    Unparsable,
}

pub struct Processor {
    id: String,
    fetch: Arc<BasicFetch>,
    ctx: RuntimeContext,
    retry: RetryHandler,
    quiet: watch::Receiver<bool>,
    current: WorkSlot,
}

impl Processor {
    pub fn new(
        id: impl Into<String>,
        fetch: Arc<BasicFetch>,
        ctx: RuntimeContext,
        retry: RetryHandler,
        quiet: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: id.into(),
            fetch,
            ctx,
            retry,
            quiet,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current(&self) -> WorkSlot {
        Arc::clone(&self.current)
    }

    /// Main loop; returns once quieted.
    pub async fn run(mut self) {
        debug!(worker_id = %self.id, "Processor started");

        loop {
            if *self.quiet.borrow() {
                break;
            }

            match self.fetch.retrieve_work().await {
                Ok(Some(work)) => {
                    self.process(work).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to fetch work");
                    tokio::select! {
                        _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                        _ = self.quiet.changed() => {}
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Processor stopped");
    }

    /// Executes one fetched job and records its outcome.
    pub async fn process(&self, work: UnitOfWork) -> Processed {
        self.set_current(Some(work.clone()));
        let outcome = self.execute(&work).await;
        self.set_current(None);
        outcome
    }

    async fn execute(&self, work: &UnitOfWork) -> Processed {
        let mut job = match JobDescriptor::from_json(&work.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    queue = %work.queue,
                    error = %e,
                    "Unparsable job payload, moving to dead set"
                );
                if let Err(e) = self.retry.kill_payload(&work.payload).await {
                    error!(worker_id = %self.id, error = %e, "Failed to kill unparsable payload");
                }
                return Processed::Unparsable;
            }
        };

        self.ctx.work_state.register(
            &self.id,
            WorkEntry {
                queue: work.queue.clone(),
                payload: work.payload.clone(),
                run_at: self.ctx.clock.now(),
            },
        );

        let registered = self.ctx.registry.get(&job.class).cloned();
        let result = match &registered {
            Some(registered) => self.invoke(&mut job, &work.queue, registered.worker.as_ref()).await,
            None => Err(JobError::UnknownClass(job.class.clone())),
        };

        self.ctx.work_state.remove(&self.id);
        self.ctx.counters.record_processed();

        let Err(err) = result else {
            return Processed::Succeeded;
        };
        self.ctx.counters.record_failed();

        let worker = registered.as_ref().map(|r| r.worker.as_ref());
        let jid = job.jid.clone();
        if let Err(e) = self.retry.handle(job, &work.queue, &err, worker).await {
            error!(
                worker_id = %self.id,
                jid = %jid,
                error = %e,
                "Failed to record job failure"
            );
        }
        Processed::Failed
    }

    /// Runs the server chain, turning a panic into a job error.
    async fn invoke(
        &self,
        job: &mut JobDescriptor,
        queue: &str,
        worker: &dyn Worker,
    ) -> Result<(), JobError> {
        let chain = &self.ctx.server_middleware;
        match AssertUnwindSafe(chain.invoke(job, queue, worker))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                info!(worker_id = %self.id, panic = %message, "Job panicked");
                Err(JobError::Panicked(message))
            }
        }
    }

    fn set_current(&self, work: Option<UnitOfWork>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = work;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
