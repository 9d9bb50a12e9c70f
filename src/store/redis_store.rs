//! Redis-backed [`Store`].
//!
//! Each pooled connection is its own `ConnectionManager` (and therefore its
//! own socket): a processor blocked in `BRPOP` must not stall commands from
//! other tasks queued behind it on a shared multiplexed connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::keys;
use super::pool::{ConnectionPool, PooledConnection};
use super::{Beat, Push, Store, StoreError};

/// Seconds a pending remote signal survives.
const SIGNAL_TTL_SECS: u64 = 60;

/// Store backed by a pool of redis connections.
pub struct RedisStore {
    url: String,
    pool: ConnectionPool<ConnectionManager>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl RedisStore {
    /// Opens `size` connections to `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the URL is invalid or any
    /// connection cannot be established.
    pub async fn connect(
        url: &str,
        size: usize,
        checkout_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = ConnectionManager::new(client.clone())
                .await
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
            connections.push(conn);
        }

        debug!(url = %url, size, "Opened redis connection pool");

        Ok(Self {
            url: url.to_string(),
            pool: ConnectionPool::new(connections, checkout_timeout),
        })
    }

    /// Redis URL this store is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn conn(&self) -> Result<PooledConnection<'_, ConnectionManager>, StoreError> {
        self.pool.get().await
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, pushes: &[Push]) -> Result<(), StoreError> {
        if pushes.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for push in pushes {
            match push {
                Push::Queue { queue, payload } => {
                    pipe.cmd("SADD").arg(keys::QUEUES).arg(queue).ignore();
                    pipe.cmd("LPUSH")
                        .arg(keys::queue(queue))
                        .arg(payload)
                        .ignore();
                }
                Push::Schedule { at, payload } => {
                    pipe.cmd("ZADD")
                        .arg(keys::SCHEDULE)
                        .arg(*at)
                        .arg(payload)
                        .ignore();
                }
                Push::Requeue { queue, payload } => {
                    pipe.cmd("RPUSH")
                        .arg(keys::queue(queue))
                        .arg(payload)
                        .ignore();
                }
            }
        }

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        if queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let queue_keys: Vec<String> = queues.iter().map(|q| keys::queue(q)).collect();
        let timeout_secs = brpop_timeout(timeout);

        let mut conn = self.conn().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&queue_keys)
            .arg(timeout_secs)
            .query_async(&mut *conn)
            .await?;

        Ok(popped.map(|(key, payload)| {
            let queue = keys::queue_name(&key).unwrap_or(&key).to_string();
            (queue, payload)
        }))
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = conn.smembers(keys::QUEUES).await?;
        names.sort();
        Ok(names)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let len: usize = conn.llen(keys::queue(queue)).await?;
        Ok(len)
    }

    async fn queue_range(
        &self,
        queue: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let payloads: Vec<String> = conn.lrange(keys::queue(queue), start, stop).await?;
        Ok(payloads)
    }

    async fn remove_from_queue(&self, queue: &str, payload: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.lrem(keys::queue(queue), 1, payload).await?;
        Ok(removed > 0)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(keys::queue(queue))
            .ignore()
            .cmd("SREM")
            .arg(keys::QUEUES)
            .arg(queue)
            .ignore();

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn add_to_set(&self, set: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZADD")
            .arg(set)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn kill(
        &self,
        member: &str,
        now: f64,
        expire_before: f64,
        max_jobs: usize,
    ) -> Result<(), StoreError> {
        let keep_from = -(max_jobs as i64) - 1;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(keys::DEAD)
            .arg(now)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(keys::DEAD)
            .arg("-inf")
            .arg(format!("({expire_before}"))
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(keys::DEAD)
            .arg(0)
            .arg(keep_from)
            .ignore();

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn due_members(
        &self,
        set: &str,
        now: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut *conn)
            .await?;
        Ok(members)
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(set, member).await?;
        Ok(removed > 0)
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let len: usize = conn.zcard(set).await?;
        Ok(len)
    }

    async fn set_range(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, f64)> = conn.zrange_withscores(set, start, stop).await?;
        Ok(entries)
    }

    async fn clear_set(&self, set: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(set).await?;
        Ok(())
    }

    async fn increment_stats(
        &self,
        processed: u64,
        failed: u64,
        day: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl_secs = ttl.as_secs();
        let daily_processed = keys::daily_processed(day);
        let daily_failed = keys::daily_failed(day);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCRBY")
            .arg(keys::STAT_PROCESSED)
            .arg(processed)
            .ignore()
            .cmd("INCRBY")
            .arg(&daily_processed)
            .arg(processed)
            .ignore()
            .cmd("EXPIRE")
            .arg(&daily_processed)
            .arg(ttl_secs)
            .ignore()
            .cmd("INCRBY")
            .arg(keys::STAT_FAILED)
            .arg(failed)
            .ignore()
            .cmd("INCRBY")
            .arg(&daily_failed)
            .arg(failed)
            .ignore()
            .cmd("EXPIRE")
            .arg(&daily_failed)
            .arg(ttl_secs)
            .ignore();

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let values: Vec<Option<u64>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn heartbeat(&self, beat: &Beat) -> Result<Option<String>, StoreError> {
        let ttl_secs = beat.ttl.as_secs();
        let work_key = keys::work(&beat.identity);
        let fields = [
            ("info", beat.info.clone()),
            ("busy", beat.busy.to_string()),
            ("beat", beat.beat.to_string()),
            ("rtt_us", beat.rtt_us.to_string()),
            ("quiet", beat.quiet.to_string()),
            ("rss", beat.rss_kb.to_string()),
        ];

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(keys::PROCESSES)
            .arg(&beat.identity)
            .ignore()
            .cmd("DEL")
            .arg(&work_key)
            .ignore();
        if !beat.work.is_empty() {
            pipe.cmd("HSET").arg(&work_key).arg(&beat.work).ignore();
            pipe.cmd("EXPIRE").arg(&work_key).arg(ttl_secs).ignore();
        }
        pipe.cmd("HSET")
            .arg(&beat.identity)
            .arg(&fields[..])
            .ignore()
            .cmd("EXPIRE")
            .arg(&beat.identity)
            .arg(ttl_secs)
            .ignore()
            .cmd("RPOP")
            .arg(keys::signals(&beat.identity));

        let mut conn = self.conn().await?;
        let (signal,): (Option<String>,) = pipe.query_async(&mut *conn).await?;
        Ok(signal)
    }

    async fn clear_process(&self, identity: &str) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SREM")
            .arg(keys::PROCESSES)
            .arg(identity)
            .ignore()
            .cmd("DEL")
            .arg(keys::work(identity))
            .ignore()
            .cmd("DEL")
            .arg(identity)
            .ignore();

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn process_identities(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut identities: Vec<String> = conn.smembers(keys::PROCESSES).await?;
        identities.sort();
        Ok(identities)
    }

    async fn process_fields(
        &self,
        identity: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(identity).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn process_work(&self, identity: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        let work: HashMap<String, String> = conn.hgetall(keys::work(identity)).await?;
        Ok(work)
    }

    async fn remove_processes(&self, identities: &[String]) -> Result<(), StoreError> {
        if identities.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        redis::cmd("SREM")
            .arg(keys::PROCESSES)
            .arg(identities)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn send_signal(&self, identity: &str, signal: &str) -> Result<(), StoreError> {
        let key = keys::signals(identity);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(signal)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(SIGNAL_TTL_SECS)
            .ignore();

        let mut conn = self.conn().await?;
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;
        Ok(())
    }
}

/// BRPOP timeout in fractional seconds (redis 6+). Zero would block forever,
/// so it is clamped to one millisecond.
fn brpop_timeout(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.001)
}
