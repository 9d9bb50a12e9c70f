//! Scheduled poller: moves due jobs from the retry and schedule sets back
//! onto their queues.
//!
//! Several processes poll the same sets. Each member is removed before it
//! is pushed and only the process whose removal succeeded pushes it, so a
//! due job is delivered once per poll race.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientError};
use crate::job::JobDescriptor;
use crate::launcher::RuntimeContext;
use crate::metrics::MetricsCollector;
use crate::store::keys;

/// Sets scanned on every pass, in order.
const SORTED_SETS: [&str; 2] = [keys::RETRY, keys::SCHEDULE];

/// Members read per store round trip.
const DUE_BATCH: usize = 100;

/// Cluster size from which polls are spread over the whole interval.
const SPREAD_THRESHOLD: usize = 10;

/// Seconds until the next poll.
///
/// `fixed_average` wins over `average × process_count`. With fewer than ten
/// processes the wait is in `[0.5, 1.5) × interval`, otherwise in
/// `[0, 1) × interval`. `roll` is a uniform sample in `[0, 1)`.
pub fn poll_interval(
    average: f64,
    fixed_average: Option<f64>,
    process_count: usize,
    roll: f64,
) -> f64 {
    let count = process_count.max(1);
    let interval = fixed_average.unwrap_or(average * count as f64);
    if count < SPREAD_THRESHOLD {
        interval * (roll + 0.5)
    } else {
        interval * roll
    }
}

pub struct Poller {
    ctx: RuntimeContext,
    client: Client,
    metrics: MetricsCollector,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("stopped", &*self.stop_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(ctx: RuntimeContext) -> Self {
        let client = ctx.client();
        let (stop_tx, _) = watch::channel(false);
        Self {
            ctx,
            client,
            metrics: MetricsCollector::new(),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Runs one pass over both sets; returns how many jobs were enqueued.
    pub async fn enqueue_jobs(&self) -> Result<usize, ClientError> {
        let mut total = 0;
        for set in SORTED_SETS {
            let moved = self.enqueue_set(set).await?;
            if moved > 0 {
                self.metrics.record_scheduled_enqueue(set, moved);
                debug!(set, moved, "Enqueued due jobs");
            }
            total += moved;
        }
        Ok(total)
    }

    async fn enqueue_set(&self, set: &str) -> Result<usize, ClientError> {
        let store = &self.ctx.store;
        let mut moved = 0;

        loop {
            let now = self.ctx.clock.now();
            let due = store.due_members(set, now, DUE_BATCH).await?;
            if due.is_empty() {
                return Ok(moved);
            }

            for member in &due {
                // Lost the race to another process.
                if !store.remove_from_set(set, member).await? {
                    continue;
                }

                let job = match JobDescriptor::from_json(member) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(set, error = %e, "Unparsable member, moving to dead set");
                        self.kill(member).await?;
                        continue;
                    }
                };

                match self.client.push(job).await {
                    Ok(_) => moved += 1,
                    Err(ClientError::Validation(e)) => {
                        warn!(set, error = %e, "Invalid member, moving to dead set");
                        self.kill(member).await?;
                    }
                    Err(e) => {
                        // Put it back so the next pass retries it.
                        if let Err(restore) = store.add_to_set(set, now, member).await {
                            error!(set, error = %restore, member = %member, "Failed to restore member");
                        }
                        return Err(e);
                    }
                }
            }

            if due.len() < DUE_BATCH {
                return Ok(moved);
            }
        }
    }

    async fn kill(&self, member: &str) -> Result<(), ClientError> {
        self.ctx
            .retry_handler(Arc::clone(&self.ctx.store))
            .kill_payload(member)
            .await?;
        Ok(())
    }

    /// Spawns the polling loop. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let poller = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(async move { poller.run(stop_rx).await }));
    }

    /// Asks the loop to exit after its current pass.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Signals stop and waits for the loop to exit.
    pub async fn terminate(&self) {
        self.signal_stop();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Poller task failed");
            }
        }
    }

    async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        let initial = self.ctx.config.poll_initial_wait_secs * (roll() + 0.5);
        info!(initial_wait_secs = initial, "Scheduled poller started");

        if !wait_or_stop(&mut stop_rx, Duration::from_secs_f64(initial)).await {
            loop {
                if let Err(e) = self.enqueue_jobs().await {
                    error!(error = %e, "Scheduled poll failed");
                }

                let wait = self.next_wait().await;
                if wait_or_stop(&mut stop_rx, wait).await {
                    break;
                }
            }
        }

        info!("Scheduled poller stopped");
    }

    async fn next_wait(&self) -> Duration {
        let process_count = match self.ctx.store.process_identities().await {
            Ok(identities) => identities.len(),
            Err(e) => {
                debug!(error = %e, "Could not count processes, assuming one");
                1
            }
        };
        let secs = poll_interval(
            self.ctx.config.average_scheduled_poll_interval_secs,
            self.ctx.config.poll_interval_average_secs,
            process_count,
            roll(),
        );
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn is_running(&self) -> bool {
        self.task
            .try_lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(true)
    }
}

fn roll() -> f64 {
    rand::rng().random::<f64>()
}

/// Sleeps for `wait`; returns true when stop was signalled first.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    if *stop_rx.borrow_and_update() {
        return true;
    }
    tokio::select! {
        biased;
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
        _ = tokio::time::sleep(wait) => *stop_rx.borrow(),
    }
}
