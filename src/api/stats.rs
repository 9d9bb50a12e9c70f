//! Cluster-wide counters and sizes.

use std::sync::Arc;

use serde::Serialize;

use super::queue::QueueView;
use super::ApiError;
use crate::clock::day_stamp;
use crate::job::DEFAULT_QUEUE;
use crate::store::{keys, Store};

/// Per-day counters are kept for five years.
const MAX_HISTORY_DAYS: u32 = 5 * 365;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub processed: u64,
    pub failed: u64,
    pub scheduled_size: usize,
    pub retry_size: usize,
    pub dead_size: usize,
    pub processes_size: usize,
    /// Busy workers summed over every live process.
    pub workers_size: usize,
    /// Jobs waiting in all queues.
    pub enqueued: usize,
    pub default_queue_latency: f64,
    /// Queue sizes, largest first.
    pub queues: Vec<(String, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayStats {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub processed: u64,
    pub failed: u64,
}

impl Stats {
    pub async fn fetch(store: &Arc<dyn Store>, now: f64) -> Result<Self, ApiError> {
        let totals = store
            .counters(&[keys::STAT_PROCESSED.to_string(), keys::STAT_FAILED.to_string()])
            .await?;

        let identities = store.process_identities().await?;
        let mut workers_size = 0;
        for identity in &identities {
            if let Some(fields) = store.process_fields(identity).await? {
                workers_size += fields
                    .get("busy")
                    .and_then(|busy| busy.parse::<usize>().ok())
                    .unwrap_or(0);
            }
        }

        let mut queues = Vec::new();
        for name in store.queue_names().await? {
            let size = store.queue_len(&name).await?;
            queues.push((name, size));
        }
        queues.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let default_queue_latency = QueueView::new(Arc::clone(store), DEFAULT_QUEUE)
            .latency(now)
            .await?;

        Ok(Self {
            processed: totals.first().copied().unwrap_or(0),
            failed: totals.get(1).copied().unwrap_or(0),
            scheduled_size: store.set_len(keys::SCHEDULE).await?,
            retry_size: store.set_len(keys::RETRY).await?,
            dead_size: store.set_len(keys::DEAD).await?,
            processes_size: identities.len(),
            workers_size,
            enqueued: queues.iter().map(|(_, size)| size).sum(),
            default_queue_latency,
            queues,
        })
    }

    /// Processed/failed counts for the `days` days ending at `now`, newest
    /// first.
    pub async fn history(
        store: &Arc<dyn Store>,
        days: u32,
        now: f64,
    ) -> Result<Vec<DayStats>, ApiError> {
        if days == 0 || days > MAX_HISTORY_DAYS {
            return Err(ApiError::InvalidDays {
                days,
                max: MAX_HISTORY_DAYS,
            });
        }

        let dates: Vec<String> = (0..days)
            .map(|offset| day_stamp(now - f64::from(offset) * SECONDS_PER_DAY))
            .collect();
        let mut counter_keys = Vec::with_capacity(dates.len() * 2);
        for date in &dates {
            counter_keys.push(keys::daily_processed(date));
            counter_keys.push(keys::daily_failed(date));
        }

        let values = store.counters(&counter_keys).await?;
        Ok(dates
            .into_iter()
            .zip(values.chunks(2))
            .map(|(date, pair)| DayStats {
                date,
                processed: pair.first().copied().unwrap_or(0),
                failed: pair.get(1).copied().unwrap_or(0),
            })
            .collect())
    }
}
