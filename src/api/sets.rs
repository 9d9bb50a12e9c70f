//! The schedule, retry and dead sets.

use std::sync::Arc;

use super::{ApiError, JobRecord};
use crate::client::Client;
use crate::clock::{Clock, SystemClock};
use crate::job::JobDescriptor;
use crate::processor::DeadSetLimits;
use crate::store::{keys, Store};

const PAGE_SIZE: usize = 100;

/// One member of a sorted set with its score (unix seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct SortedEntry {
    pub record: JobRecord,
    pub score: f64,
}

impl SortedEntry {
    pub fn jid(&self) -> Option<&str> {
        self.record.jid()
    }

    pub fn item(&self) -> Option<&JobDescriptor> {
        self.record.item.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.item().is_some_and(JobDescriptor::has_error)
    }
}

/// A sorted set of jobs keyed by time.
#[derive(Debug, Clone)]
pub struct JobSet {
    store: Arc<dyn Store>,
    name: &'static str,
    dead_limits: DeadSetLimits,
    clock: Arc<dyn Clock>,
}

impl JobSet {
    fn new(store: Arc<dyn Store>, name: &'static str) -> Self {
        Self {
            store,
            name,
            dead_limits: DeadSetLimits::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn scheduled(store: Arc<dyn Store>) -> Self {
        Self::new(store, keys::SCHEDULE)
    }

    pub fn retries(store: Arc<dyn Store>) -> Self {
        Self::new(store, keys::RETRY)
    }

    pub fn dead(store: Arc<dyn Store>) -> Self {
        Self::new(store, keys::DEAD)
    }

    /// Trimming applied when [`JobSet::kill`] moves a job to the dead set.
    pub fn with_dead_limits(mut self, limits: DeadSetLimits) -> Self {
        self.dead_limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub async fn size(&self) -> Result<usize, ApiError> {
        Ok(self.store.set_len(self.name).await?)
    }

    /// Up to `count` entries starting at `start`, earliest score first.
    pub async fn entries(&self, start: usize, count: usize) -> Result<Vec<SortedEntry>, ApiError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let from = isize::try_from(start).unwrap_or(isize::MAX);
        let to = isize::try_from(start + count - 1).unwrap_or(isize::MAX);
        let raw = self.store.set_range(self.name, from, to).await?;
        Ok(raw
            .into_iter()
            .map(|(value, score)| SortedEntry {
                record: JobRecord::parse(value),
                score,
            })
            .collect())
    }

    pub async fn find_job(&self, jid: &str) -> Result<Option<SortedEntry>, ApiError> {
        let mut start = 0;
        loop {
            let page = self.entries(start, PAGE_SIZE).await?;
            if page.is_empty() {
                return Ok(None);
            }
            if let Some(found) = page.iter().find(|entry| entry.jid() == Some(jid)) {
                return Ok(Some(found.clone()));
            }
            start += page.len();
        }
    }

    /// Removes the entry; false when it was already gone.
    pub async fn delete(&self, entry: &SortedEntry) -> Result<bool, ApiError> {
        Ok(self
            .store
            .remove_from_set(self.name, &entry.record.value)
            .await?)
    }

    /// Pushes the entry back onto its queue now.
    ///
    /// `retry_count` is decremented so the next failure records the same
    /// attempt number again. False when another caller removed it first.
    pub async fn retry(&self, entry: &SortedEntry, client: &Client) -> Result<bool, ApiError> {
        let mut job = JobDescriptor::from_json(&entry.record.value)?;
        if !self.delete(entry).await? {
            return Ok(false);
        }

        if let Some(count) = job.retry_count {
            job.retry_count = count.checked_sub(1);
        }
        job.at = None;
        client.push(job).await?;
        Ok(true)
    }

    /// Moves the entry to the dead set.
    pub async fn kill(&self, entry: &SortedEntry) -> Result<bool, ApiError> {
        if !self.delete(entry).await? {
            return Ok(false);
        }

        let now = self.clock.now();
        self.store
            .kill(
                &entry.record.value,
                now,
                now - self.dead_limits.timeout.as_secs_f64(),
                self.dead_limits.max_jobs,
            )
            .await?;
        Ok(true)
    }

    /// Retries every parsable entry; returns how many were pushed.
    pub async fn retry_all(&self, client: &Client) -> Result<usize, ApiError> {
        let mut moved = 0;
        // Unparsable entries stay where they are and are skipped over.
        let mut skipped = 0;

        loop {
            let page = self.entries(skipped, PAGE_SIZE).await?;
            if page.is_empty() {
                return Ok(moved);
            }
            for entry in &page {
                if entry.item().is_none() {
                    skipped += 1;
                } else if self.retry(entry, client).await? {
                    moved += 1;
                }
            }
        }
    }

    pub async fn clear(&self) -> Result<(), ApiError> {
        Ok(self.store.clear_set(self.name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const NOW: f64 = 1_700_000_000.0;

    fn failed_job(jid: &str, retry_count: u32) -> String {
        let mut job = JobDescriptor::new("Sync", [jid])
            .expect("valid job")
            .with_jid(jid)
            .with_queue("sync");
        job.retry_count = Some(retry_count);
        job.error_class = Some("JobFailed".to_string());
        job.to_json().expect("serializes")
    }

    async fn retries(count: u32) -> (MemoryStore, JobSet, Client) {
        let store = MemoryStore::new();
        for i in 0..count {
            store
                .add_to_set(keys::RETRY, NOW + f64::from(i), &failed_job(&format!("r{i}"), 2))
                .await
                .expect("zadd");
        }
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
        let set = JobSet::retries(Arc::clone(&shared)).with_clock(Arc::clone(&clock));
        let client = Client::new(shared).with_clock(clock);
        (store, set, client)
    }

    #[tokio::test]
    async fn test_entries_and_find() {
        let (_, set, _) = retries(3).await;
        assert_eq!(set.name(), "retry");
        assert_eq!(set.size().await.expect("size"), 3);

        let entries = set.entries(0, 10).await.expect("entries");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].jid(), Some("r0"));
        assert_eq!(entries[2].score, NOW + 2.0);
        assert!(entries[0].has_error());

        let found = set.find_job("r1").await.expect("find").expect("present");
        assert_eq!(found.score, NOW + 1.0);
        assert!(set.find_job("nope").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn test_retry_pushes_and_decrements() {
        let (store, set, client) = retries(1).await;
        let entry = set.find_job("r0").await.expect("find").expect("present");

        assert!(set.retry(&entry, &client).await.expect("retry"));
        assert!(!set.retry(&entry, &client).await.expect("retry"));
        assert_eq!(set.size().await.expect("size"), 0);

        let queued = store.queue_range("sync", 0, -1).await.expect("lrange");
        let job = JobDescriptor::from_json(&queued[0]).expect("valid");
        assert_eq!(job.retry_count, Some(1));
        assert_eq!(job.enqueued_at, Some(NOW));
    }

    #[tokio::test]
    async fn test_kill_moves_to_dead() {
        let (store, set, _) = retries(2).await;
        let entry = set.find_job("r1").await.expect("find").expect("present");

        assert!(set.kill(&entry).await.expect("kill"));
        assert_eq!(set.size().await.expect("size"), 1);

        let dead = JobSet::dead(Arc::new(store.clone()));
        let killed = dead.find_job("r1").await.expect("find").expect("present");
        assert_eq!(killed.score, NOW);
    }

    #[tokio::test]
    async fn test_retry_all_skips_unparsable() {
        let (store, set, client) = retries(3).await;
        store
            .add_to_set(keys::RETRY, NOW - 1.0, "not json")
            .await
            .expect("zadd");

        assert_eq!(set.retry_all(&client).await.expect("retry all"), 3);
        assert_eq!(set.size().await.expect("size"), 1);
        assert_eq!(store.queue_len("sync").await.expect("llen"), 3);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_, set, _) = retries(3).await;
        let entry = set.find_job("r0").await.expect("find").expect("present");
        assert!(set.delete(&entry).await.expect("delete"));
        assert!(!set.delete(&entry).await.expect("delete"));

        set.clear().await.expect("clear");
        assert_eq!(set.size().await.expect("size"), 0);
    }
}
