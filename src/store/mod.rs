//! Access to the shared key-value store.
//!
//! Every [`Store`] method is exactly one round trip. Operations touching
//! more than one key are sent as a single `MULTI`/`EXEC` transaction, so the
//! store never observes half of one.
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: pooled redis connections, used in production
//! - [`MemoryStore`]: an in-process model of the same key layout, used by
//!   tests and local runs

pub mod keys;
pub mod memory;
pub mod pool;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::pool::{ConnectionPool, PooledConnection};
pub use self::redis_store::RedisStore;

/// Errors that can occur while talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// A redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled connection became free in time.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The store cannot serve requests right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One write in an atomic push batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Register the queue and `LPUSH` the payload onto it.
    Queue { queue: String, payload: String },
    /// `ZADD schedule` with the given score.
    Schedule { at: f64, payload: String },
    /// `RPUSH` the payload so it is the next one fetched from the queue.
    Requeue { queue: String, payload: String },
}

/// Everything one heartbeat writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Beat {
    pub identity: String,
    /// JSON process metadata.
    pub info: String,
    pub busy: usize,
    pub beat: f64,
    pub rtt_us: u64,
    pub quiet: bool,
    pub rss_kb: u64,
    /// Worker id → JSON work entry. Replaces the whole work hash.
    pub work: Vec<(String, String)>,
    pub ttl: Duration,
}

/// Operations the runtime performs against the shared store.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Applies all pushes in one transaction.
    async fn push(&self, pushes: &[Push]) -> Result<(), StoreError>;

    /// Pops the oldest job from the first non-empty queue, checking queues in
    /// the given order and blocking up to `timeout`.
    ///
    /// Returns the queue name (not its key) and the raw payload.
    async fn fetch(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Names of all known queues.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError>;

    /// Payloads between `start` and `stop` (inclusive, `LRANGE` semantics).
    /// Index 0 is the most recently pushed job.
    async fn queue_range(
        &self,
        queue: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError>;

    /// Removes one occurrence of `payload` from the queue.
    async fn remove_from_queue(&self, queue: &str, payload: &str) -> Result<bool, StoreError>;

    /// Deletes the queue and unregisters its name.
    async fn delete_queue(&self, queue: &str) -> Result<(), StoreError>;

    async fn add_to_set(&self, set: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// Adds `member` to the dead set, then drops dead entries scored before
    /// `expire_before` and all but the newest `max_jobs`.
    async fn kill(
        &self,
        member: &str,
        now: f64,
        expire_before: f64,
        max_jobs: usize,
    ) -> Result<(), StoreError>;

    /// Up to `limit` members of `set` scored at or before `now`, oldest first.
    async fn due_members(
        &self,
        set: &str,
        now: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Removes `member`; true when this call removed it.
    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_len(&self, set: &str) -> Result<usize, StoreError>;

    /// Members with scores, ordered by score (`ZRANGE ... WITHSCORES`).
    async fn set_range(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    async fn clear_set(&self, set: &str) -> Result<(), StoreError>;

    /// Adds to the global and per-day processed/failed counters.
    async fn increment_stats(
        &self,
        processed: u64,
        failed: u64,
        day: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Reads integer counters; missing keys read as zero.
    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// Writes the process record and work hash, and pops one pending signal.
    async fn heartbeat(&self, beat: &Beat) -> Result<Option<String>, StoreError>;

    /// Removes a process record, its work hash and its `processes` membership.
    async fn clear_process(&self, identity: &str) -> Result<(), StoreError>;

    async fn process_identities(&self) -> Result<Vec<String>, StoreError>;

    /// Fields of a process record, `None` once it has expired.
    async fn process_fields(
        &self,
        identity: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError>;

    async fn process_work(&self, identity: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Drops identities from the `processes` set.
    async fn remove_processes(&self, identities: &[String]) -> Result<(), StoreError>;

    /// `SET key NX EX ttl`; true when the lock was taken.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Queues a signal for a process; the list expires after a minute.
    async fn send_signal(&self, identity: &str, signal: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
