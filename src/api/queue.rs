//! Live queue inspection.

use std::sync::Arc;

use super::{ApiError, JobRecord};
use crate::store::Store;

const PAGE_SIZE: usize = 50;

/// A named queue. Contents change under the caller while it reads.
#[derive(Debug, Clone)]
pub struct QueueView {
    store: Arc<dyn Store>,
    name: String,
}

impl QueueView {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Every known queue, sorted by name.
    pub async fn all(store: &Arc<dyn Store>) -> Result<Vec<Self>, ApiError> {
        let mut names = store.queue_names().await?;
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| Self::new(Arc::clone(store), name))
            .collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn size(&self) -> Result<usize, ApiError> {
        Ok(self.store.queue_len(&self.name).await?)
    }

    /// Seconds the oldest job has been waiting; 0 for an empty queue.
    pub async fn latency(&self, now: f64) -> Result<f64, ApiError> {
        let oldest = self.store.queue_range(&self.name, -1, -1).await?;
        Ok(oldest
            .into_iter()
            .next()
            .and_then(|raw| JobRecord::parse(raw).item)
            .map_or(0.0, |job| job.latency(now)))
    }

    /// Up to `count` jobs starting at `start`, newest first.
    pub async fn jobs(&self, start: usize, count: usize) -> Result<Vec<JobRecord>, ApiError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let from = isize::try_from(start).unwrap_or(isize::MAX);
        let to = isize::try_from(start + count - 1).unwrap_or(isize::MAX);
        let raw = self.store.queue_range(&self.name, from, to).await?;
        Ok(raw.into_iter().map(JobRecord::parse).collect())
    }

    pub async fn find_job(&self, jid: &str) -> Result<Option<JobRecord>, ApiError> {
        let mut start = 0;
        loop {
            let page = self.jobs(start, PAGE_SIZE).await?;
            if page.is_empty() {
                return Ok(None);
            }
            if let Some(found) = page.iter().find(|record| record.jid() == Some(jid)) {
                return Ok(Some(found.clone()));
            }
            start += page.len();
        }
    }

    /// Removes one job; false when it was already gone.
    pub async fn delete_job(&self, record: &JobRecord) -> Result<bool, ApiError> {
        Ok(self.store.remove_from_queue(&self.name, &record.value).await?)
    }

    /// Deletes the queue and unregisters its name.
    pub async fn clear(&self) -> Result<(), ApiError> {
        Ok(self.store.delete_queue(&self.name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDescriptor;
    use crate::store::{MemoryStore, Push};

    async fn queue_with(count: usize) -> (Arc<dyn Store>, QueueView) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let pushes: Vec<Push> = (0..count)
            .map(|i| {
                let mut job = JobDescriptor::new("Mailer", [i])
                    .expect("valid job")
                    .with_jid(format!("jid-{i}"))
                    .with_queue("mailers");
                job.enqueued_at = Some(100.0 + i as f64);
                Push::Queue {
                    queue: "mailers".to_string(),
                    payload: job.to_json().expect("serializes"),
                }
            })
            .collect();
        if !pushes.is_empty() {
            store.push(&pushes).await.expect("push");
        }
        let view = QueueView::new(Arc::clone(&store), "mailers");
        (store, view)
    }

    #[tokio::test]
    async fn test_size_and_latency() {
        let (_, view) = queue_with(3).await;
        assert_eq!(view.size().await.expect("size"), 3);
        assert_eq!(view.latency(110.0).await.expect("latency"), 10.0);

        let (_, empty) = queue_with(0).await;
        assert_eq!(empty.latency(110.0).await.expect("latency"), 0.0);
    }

    #[tokio::test]
    async fn test_paging_and_find() {
        let (_, view) = queue_with(120).await;

        let first = view.jobs(0, 2).await.expect("page");
        assert_eq!(first[0].jid(), Some("jid-119"));
        assert_eq!(first[1].jid(), Some("jid-118"));
        assert!(view.jobs(0, 0).await.expect("page").is_empty());

        let found = view.find_job("jid-3").await.expect("find").expect("present");
        assert_eq!(found.class(), Some("Mailer"));
        assert!(view.find_job("missing").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (store, view) = queue_with(2).await;
        let record = view.find_job("jid-0").await.expect("find").expect("present");

        assert!(view.delete_job(&record).await.expect("delete"));
        assert!(!view.delete_job(&record).await.expect("delete"));
        assert_eq!(view.size().await.expect("size"), 1);

        view.clear().await.expect("clear");
        assert_eq!(view.size().await.expect("size"), 0);
        assert!(QueueView::all(&store).await.expect("all").is_empty());
    }
}
