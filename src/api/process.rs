//! Live processes and their in-flight work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::ApiError;
use crate::job::JobDescriptor;
use crate::launcher::{ProcessInfo, Signal, WorkEntry};
use crate::store::{keys, Store};

/// Cleanup runs at most once per this period across the cluster.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One live process as reported by its last heartbeat.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    store: Arc<dyn Store>,
    pub info: ProcessInfo,
    pub busy: usize,
    pub beat: f64,
    pub quiet: bool,
    pub rss_kb: u64,
    pub rtt_us: u64,
}

impl ProcessRecord {
    fn from_fields(
        store: Arc<dyn Store>,
        fields: &HashMap<String, String>,
    ) -> Result<Option<Self>, ApiError> {
        let Some(info) = fields.get("info") else {
            return Ok(None);
        };

        fn number<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, key: &str) -> T {
            fields
                .get(key)
                .and_then(|value| value.parse().ok())
                .unwrap_or_default()
        }

        Ok(Some(Self {
            store,
            info: serde_json::from_str(info)?,
            busy: number(fields, "busy"),
            beat: number(fields, "beat"),
            quiet: fields.get("quiet").is_some_and(|q| q == "true"),
            rss_kb: number(fields, "rss"),
            rtt_us: number(fields, "rtt_us"),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.info.identity
    }

    /// True once the process stopped fetching work.
    pub fn is_stopping(&self) -> bool {
        self.quiet
    }

    pub async fn quiet(&self) -> Result<(), ApiError> {
        self.signal(Signal::Quiet).await
    }

    pub async fn stop(&self) -> Result<(), ApiError> {
        self.signal(Signal::Stop).await
    }

    pub async fn dump_work(&self) -> Result<(), ApiError> {
        self.signal(Signal::DumpWork).await
    }

    /// Queues `signal` for pickup on the process's next heartbeat.
    pub async fn signal(&self, signal: Signal) -> Result<(), ApiError> {
        Ok(self
            .store
            .send_signal(self.identity(), signal.as_remote())
            .await?)
    }
}

/// Every process registered in the `processes` set.
#[derive(Debug, Clone)]
pub struct ProcessSet {
    store: Arc<dyn Store>,
}

impl ProcessSet {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Drops processes whose heartbeat record expired. Runs at most once per
    /// minute cluster-wide; returns how many were pruned.
    pub async fn cleanup(&self) -> Result<usize, ApiError> {
        if !self
            .store
            .acquire_lock(keys::PROCESS_CLEANUP_LOCK, CLEANUP_INTERVAL)
            .await?
        {
            return Ok(0);
        }

        let mut expired = Vec::new();
        for identity in self.store.process_identities().await? {
            let alive = self
                .store
                .process_fields(&identity)
                .await?
                .is_some_and(|fields| fields.contains_key("info"));
            if !alive {
                expired.push(identity);
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruning expired processes");
            self.store.remove_processes(&expired).await?;
        }
        Ok(expired.len())
    }

    /// Live processes sorted by identity. Members without a record are
    /// skipped.
    pub async fn list(&self) -> Result<Vec<ProcessRecord>, ApiError> {
        let mut identities = self.store.process_identities().await?;
        identities.sort();

        let mut records = Vec::with_capacity(identities.len());
        for identity in identities {
            let Some(fields) = self.store.process_fields(&identity).await? else {
                continue;
            };
            if let Some(record) = ProcessRecord::from_fields(Arc::clone(&self.store), &fields)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn get(&self, identity: &str) -> Result<Option<ProcessRecord>, ApiError> {
        match self.store.process_fields(identity).await? {
            Some(fields) => ProcessRecord::from_fields(Arc::clone(&self.store), &fields),
            None => Ok(None),
        }
    }

    /// Registered members, which may include processes that already died.
    pub async fn size(&self) -> Result<usize, ApiError> {
        Ok(self.store.process_identities().await?.len())
    }

    pub async fn total_concurrency(&self) -> Result<usize, ApiError> {
        Ok(self.list().await?.iter().map(|p| p.info.concurrency).sum())
    }

    pub async fn total_rss_kb(&self) -> Result<u64, ApiError> {
        Ok(self.list().await?.iter().map(|p| p.rss_kb).sum())
    }
}

/// One in-flight job on some process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRecord {
    pub identity: String,
    pub worker_id: String,
    pub work: WorkEntry,
}

impl WorkRecord {
    pub fn job(&self) -> Option<JobDescriptor> {
        JobDescriptor::from_json(&self.work.payload).ok()
    }
}

/// In-flight work across all processes, as of their last heartbeats.
#[derive(Debug, Clone)]
pub struct WorkSet {
    store: Arc<dyn Store>,
}

impl WorkSet {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Sorted by identity, then oldest `run_at` first.
    pub async fn list(&self) -> Result<Vec<WorkRecord>, ApiError> {
        let mut identities = self.store.process_identities().await?;
        identities.sort();

        let mut records = Vec::new();
        for identity in identities {
            let mut work: Vec<WorkRecord> = Vec::new();
            for (worker_id, raw) in self.store.process_work(&identity).await? {
                match serde_json::from_str::<WorkEntry>(&raw) {
                    Ok(entry) => work.push(WorkRecord {
                        identity: identity.clone(),
                        worker_id,
                        work: entry,
                    }),
                    Err(e) => debug!(identity = %identity, error = %e, "Skipping unreadable work entry"),
                }
            }
            work.sort_by(|a, b| a.work.run_at.total_cmp(&b.work.run_at));
            records.extend(work);
        }
        Ok(records)
    }

    /// Busy workers summed over process records; cheaper than `list`.
    pub async fn size(&self) -> Result<usize, ApiError> {
        let mut total = 0;
        for identity in self.store.process_identities().await? {
            if let Some(fields) = self.store.process_fields(&identity).await? {
                total += fields
                    .get("busy")
                    .and_then(|busy| busy.parse::<usize>().ok())
                    .unwrap_or(0);
            }
        }
        Ok(total)
    }

    pub async fn find_by_jid(&self, jid: &str) -> Result<Option<WorkRecord>, ApiError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|record| record.job().is_some_and(|job| job.jid == jid)))
    }
}
