//! Fetching work from a capsule's queues.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::config::{CapsuleConfig, QueueMode};
use crate::store::{Push, Store, StoreError};

/// A job taken off a queue, still in its raw stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    pub queue: String,
    pub payload: String,
}

impl UnitOfWork {
    fn requeue_push(&self) -> Push {
        Push::Requeue {
            queue: self.queue.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Blocking fetch over a capsule's queues, ordered per its queue mode.
#[derive(Debug)]
pub struct BasicFetch {
    store: Arc<dyn Store>,
    mode: QueueMode,
    /// Strict: distinct names in priority order. Otherwise: the
    /// weight-expanded list.
    queues: Vec<String>,
    timeout: Duration,
}

impl BasicFetch {
    pub fn new(store: Arc<dyn Store>, capsule: &CapsuleConfig, timeout: Duration) -> Self {
        let mode = capsule.mode();
        let queues = match mode {
            QueueMode::Strict => capsule.queue_names(),
            QueueMode::Random | QueueMode::Weighted => capsule.expanded_queues(),
        };

        Self {
            store,
            mode,
            queues,
            timeout,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// The order in which queues are checked by the next fetch.
    ///
    /// Strict mode always returns the configured order. Random and weighted
    /// modes shuffle the expanded list and keep each name's first
    /// occurrence, so a queue with weight 3 is three times as likely as a
    /// queue with weight 1 to be checked first.
    pub fn queue_order(&self) -> Vec<String> {
        if self.mode == QueueMode::Strict {
            return self.queues.clone();
        }

        let mut shuffled = self.queues.clone();
        shuffled.shuffle(&mut rand::rng());

        let mut order: Vec<String> = Vec::with_capacity(shuffled.len());
        for queue in shuffled {
            if !order.contains(&queue) {
                order.push(queue);
            }
        }
        order
    }

    /// Waits up to the fetch timeout for a job.
    pub async fn retrieve_work(&self) -> Result<Option<UnitOfWork>, StoreError> {
        let order = self.queue_order();
        let fetched = self.store.fetch(&order, self.timeout).await?;
        Ok(fetched.map(|(queue, payload)| UnitOfWork { queue, payload }))
    }

    /// Puts unfinished work back at the front of its queues in one round trip.
    pub async fn bulk_requeue(&self, work: &[UnitOfWork]) -> Result<(), StoreError> {
        if work.is_empty() {
            return Ok(());
        }
        let pushes: Vec<Push> = work.iter().map(UnitOfWork::requeue_push).collect();
        self.store.push(&pushes).await
    }
}
