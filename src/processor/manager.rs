//! Per-capsule processor pool.

use std::sync::{Arc, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::fetch::{BasicFetch, UnitOfWork};
use super::worker::{Processor, WorkSlot};
use crate::launcher::{Capsule, RuntimeContext};

struct ProcessorHandle {
    id: String,
    task: JoinHandle<()>,
    current: WorkSlot,
}

/// Runs `concurrency` processors over one capsule's queues.
pub struct Manager {
    capsule: Capsule,
    ctx: RuntimeContext,
    fetch: Arc<BasicFetch>,
    quiet_tx: watch::Sender<bool>,
    processors: Vec<ProcessorHandle>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("capsule", &self.capsule.config.name)
            .field("processors", &self.processors.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(capsule: Capsule, ctx: RuntimeContext) -> Self {
        let fetch = Arc::new(BasicFetch::new(
            Arc::clone(&capsule.store),
            &capsule.config,
            ctx.config.fetch_timeout(),
        ));
        let (quiet_tx, _) = watch::channel(false);

        Self {
            capsule,
            ctx,
            fetch,
            quiet_tx,
            processors: Vec::new(),
        }
    }

    pub fn capsule_name(&self) -> &str {
        &self.capsule.config.name
    }

    /// Number of processor tasks not yet reaped by `stop`.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn is_quiet(&self) -> bool {
        *self.quiet_tx.borrow()
    }

    /// Spawns the capsule's processors.
    pub fn start(&mut self) {
        let retry = self.ctx.retry_handler(Arc::clone(&self.capsule.store));

        for i in 0..self.capsule.config.concurrency {
            let id = format!("{}-{}", self.capsule.config.name, i);
            let processor = Processor::new(
                id.clone(),
                Arc::clone(&self.fetch),
                self.ctx.clone(),
                retry.clone(),
                self.quiet_tx.subscribe(),
            );
            let current = processor.current();
            let task = tokio::spawn(processor.run());

            self.processors.push(ProcessorHandle { id, task, current });
        }

        info!(
            capsule = %self.capsule.config.name,
            concurrency = self.capsule.config.concurrency,
            mode = %self.fetch.mode(),
            "Manager started"
        );
    }

    /// Stops fetching new work; in-flight jobs keep running.
    pub fn quiet(&self) {
        if !self.quiet_tx.send_replace(true) {
            info!(capsule = %self.capsule.config.name, "Manager quieted");
        }
    }

    /// Quiets, then waits for processors until `deadline`.
    ///
    /// Processors still running at the deadline are cancelled and their
    /// in-flight jobs pushed back to the front of their queues. Returns the
    /// number of processors abandoned.
    pub async fn stop(&mut self, deadline: Instant) -> usize {
        self.quiet();
        let mut processors = std::mem::take(&mut self.processors);

        let drained = {
            let wait_all = async {
                for processor in processors.iter_mut() {
                    if let Err(e) = (&mut processor.task).await {
                        error!(worker_id = %processor.id, error = %e, "Processor task failed");
                    }
                }
            };
            tokio::time::timeout_at(deadline, wait_all).await.is_ok()
        };
        if drained {
            info!(capsule = %self.capsule.config.name, "Manager stopped");
            return 0;
        }

        let mut abandoned = 0;
        let mut requeue: Vec<UnitOfWork> = Vec::new();
        for processor in processors {
            if processor.task.is_finished() {
                continue;
            }
            processor.task.abort();
            // Resolves with a cancellation error once the task is gone.
            let _ = processor.task.await;

            abandoned += 1;
            self.ctx.work_state.remove(&processor.id);
            let unit = processor
                .current
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(unit) = unit {
                requeue.push(unit);
            }
        }

        warn!(
            capsule = %self.capsule.config.name,
            abandoned,
            requeued = requeue.len(),
            "Shutdown deadline reached, abandoning processors"
        );
        if let Err(e) = self.fetch.bulk_requeue(&requeue).await {
            error!(
                capsule = %self.capsule.config.name,
                error = %e,
                "Failed to requeue in-flight jobs"
            );
        }

        abandoned
    }
}
