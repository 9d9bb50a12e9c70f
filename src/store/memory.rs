//! In-process [`Store`] with redis semantics.
//!
//! Lists, sets, sorted sets, hashes and string counters live behind one
//! mutex, so every call is atomic the way a redis transaction is. Key
//! expiry runs on tokio's clock and therefore follows `tokio::time::pause`
//! in tests. Blocking fetches wake up on pushes through a `Notify`.
//!
//! Two hooks exist for tests: [`MemoryStore::round_trips`] counts calls and
//! [`MemoryStore::fail_next`] makes the next calls fail.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::keys;
use super::{Beat, Push, Store, StoreError};

const SIGNAL_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
}

impl MemoryState {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.delete(&key);
        }
    }

    fn delete(&mut self, key: &str) {
        self.lists.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        self.hashes.remove(key);
        self.strings.remove(key);
        self.expiries.remove(key);
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        self.expiries.insert(key.to_string(), Instant::now() + ttl);
    }

    fn lpush(&mut self, key: String, value: String) {
        self.lists.entry(key).or_default().push_front(value);
    }

    fn rpush(&mut self, key: String, value: String) {
        self.lists.entry(key).or_default().push_back(value);
    }

    fn rpop(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
            self.expiries.remove(key);
        }
        value
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    /// Members ordered by score, ties broken by member.
    fn sorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn incr_by(&mut self, key: &str, delta: u64) {
        let current = self.counter(key);
        self.strings
            .insert(key.to_string(), (current + delta).to_string());
    }

    fn counter(&self, key: &str) -> u64 {
        self.strings
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    pushed: Notify,
    round_trips: AtomicUsize,
    pending_failures: AtomicUsize,
}

/// In-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls made so far.
    pub fn round_trips(&self) -> usize {
        self.shared.round_trips.load(Ordering::SeqCst)
    }

    /// Makes the next `count` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.shared.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Starts a round trip: counts it, applies injected failures, locks the
    /// state and drops expired keys.
    fn begin(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.shared.round_trips.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .shared
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        Ok(self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.purge_expired(Instant::now());
        state
    }

    fn pop_first(&self, queues: &[String]) -> Option<(String, String)> {
        let mut state = self.lock();
        queues.iter().find_map(|queue| {
            state
                .rpop(&keys::queue(queue))
                .map(|payload| (queue.clone(), payload))
        })
    }
}

/// Resolves redis-style inclusive, possibly negative, range bounds.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, pushes: &[Push]) -> Result<(), StoreError> {
        {
            let mut state = self.begin()?;
            for push in pushes {
                match push {
                    Push::Queue { queue, payload } => {
                        state.sadd(keys::QUEUES, queue);
                        state.lpush(keys::queue(queue), payload.clone());
                    }
                    Push::Schedule { at, payload } => state.zadd(keys::SCHEDULE, *at, payload),
                    Push::Requeue { queue, payload } => {
                        state.rpush(keys::queue(queue), payload.clone());
                    }
                }
            }
        }
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        drop(self.begin()?);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.pop_first(queues) {
                return Ok(Some(found));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.begin()?;
        Ok(state
            .sets
            .get(keys::QUEUES)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let state = self.begin()?;
        Ok(state
            .lists
            .get(&keys::queue(queue))
            .map_or(0, VecDeque::len))
    }

    async fn queue_range(
        &self,
        queue: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.begin()?;
        let Some(list) = state.lists.get(&keys::queue(queue)) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn remove_from_queue(&self, queue: &str, payload: &str) -> Result<bool, StoreError> {
        let mut state = self.begin()?;
        let key = keys::queue(queue);
        let Some(list) = state.lists.get_mut(&key) else {
            return Ok(false);
        };
        let Some(index) = list.iter().position(|p| p == payload) else {
            return Ok(false);
        };
        list.remove(index);
        if list.is_empty() {
            state.lists.remove(&key);
        }
        Ok(true)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        state.delete(&keys::queue(queue));
        state.srem(keys::QUEUES, queue);
        Ok(())
    }

    async fn add_to_set(&self, set: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.begin()?.zadd(set, score, member);
        Ok(())
    }

    async fn kill(
        &self,
        member: &str,
        now: f64,
        expire_before: f64,
        max_jobs: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        state.zadd(keys::DEAD, now, member);

        let entries = state.sorted(keys::DEAD);
        let overflow = entries.len().saturating_sub(max_jobs);
        for (index, (member, score)) in entries.iter().enumerate() {
            if score < &expire_before || index < overflow {
                state.zrem(keys::DEAD, member);
            }
        }
        Ok(())
    }

    async fn due_members(
        &self,
        set: &str,
        now: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.begin()?;
        Ok(state
            .sorted(set)
            .into_iter()
            .take_while(|(_, score)| *score <= now)
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.begin()?.zrem(set, member))
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        let state = self.begin()?;
        Ok(state.zsets.get(set).map_or(0, HashMap::len))
    }

    async fn set_range(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let state = self.begin()?;
        let entries = state.sorted(set);
        Ok(match resolve_range(entries.len(), start, stop) {
            Some((from, to)) => entries[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn clear_set(&self, set: &str) -> Result<(), StoreError> {
        self.begin()?.delete(set);
        Ok(())
    }

    async fn increment_stats(
        &self,
        processed: u64,
        failed: u64,
        day: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        let daily_processed = keys::daily_processed(day);
        let daily_failed = keys::daily_failed(day);

        state.incr_by(keys::STAT_PROCESSED, processed);
        state.incr_by(&daily_processed, processed);
        state.expire(&daily_processed, ttl);
        state.incr_by(keys::STAT_FAILED, failed);
        state.incr_by(&daily_failed, failed);
        state.expire(&daily_failed, ttl);
        Ok(())
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let state = self.begin()?;
        Ok(keys.iter().map(|key| state.counter(key)).collect())
    }

    async fn heartbeat(&self, beat: &Beat) -> Result<Option<String>, StoreError> {
        let mut state = self.begin()?;
        let work_key = keys::work(&beat.identity);

        state.sadd(keys::PROCESSES, &beat.identity);
        state.delete(&work_key);
        if !beat.work.is_empty() {
            state
                .hashes
                .insert(work_key.clone(), beat.work.iter().cloned().collect());
            state.expire(&work_key, beat.ttl);
        }

        let record = state.hashes.entry(beat.identity.clone()).or_default();
        record.insert("info".to_string(), beat.info.clone());
        record.insert("busy".to_string(), beat.busy.to_string());
        record.insert("beat".to_string(), beat.beat.to_string());
        record.insert("rtt_us".to_string(), beat.rtt_us.to_string());
        record.insert("quiet".to_string(), beat.quiet.to_string());
        record.insert("rss".to_string(), beat.rss_kb.to_string());
        state.expire(&beat.identity, beat.ttl);

        Ok(state.rpop(&keys::signals(&beat.identity)))
    }

    async fn clear_process(&self, identity: &str) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        state.srem(keys::PROCESSES, identity);
        state.delete(&keys::work(identity));
        state.delete(identity);
        Ok(())
    }

    async fn process_identities(&self) -> Result<Vec<String>, StoreError> {
        let state = self.begin()?;
        Ok(state
            .sets
            .get(keys::PROCESSES)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn process_fields(
        &self,
        identity: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let state = self.begin()?;
        Ok(state.hashes.get(identity).cloned())
    }

    async fn process_work(&self, identity: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.begin()?;
        Ok(state
            .hashes
            .get(&keys::work(identity))
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_processes(&self, identities: &[String]) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        for identity in identities {
            state.srem(keys::PROCESSES, identity);
        }
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.begin()?;
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), "1".to_string());
        state.expire(key, ttl);
        Ok(true)
    }

    async fn send_signal(&self, identity: &str, signal: &str) -> Result<(), StoreError> {
        let mut state = self.begin()?;
        let key = keys::signals(identity);
        state.lpush(key.clone(), signal.to_string());
        state.expire(&key, SIGNAL_TTL);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        drop(self.begin()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_push(queue: &str, payload: &str) -> Push {
        Push::Queue {
            queue: queue.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 1, 2), Some((1, 2)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(5, 6, 10), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_for_one_consumer() {
        let store = MemoryStore::new();
        store
            .push(&[queue_push("default", "a"), queue_push("default", "b")])
            .await
            .expect("push");

        let queues = vec!["default".to_string()];
        let first = store.fetch(&queues, Duration::ZERO).await.expect("fetch");
        let second = store.fetch(&queues, Duration::ZERO).await.expect("fetch");

        assert_eq!(first, Some(("default".to_string(), "a".to_string())));
        assert_eq!(second, Some(("default".to_string(), "b".to_string())));
        assert_eq!(store.queue_names().await.expect("names"), vec!["default"]);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_the_front() {
        let store = MemoryStore::new();
        store
            .push(&[
                queue_push("default", "old"),
                Push::Requeue {
                    queue: "default".to_string(),
                    payload: "returned".to_string(),
                },
            ])
            .await
            .expect("push");

        let queues = vec!["default".to_string()];
        let (_, payload) = store
            .fetch(&queues, Duration::ZERO)
            .await
            .expect("fetch")
            .expect("job");
        assert_eq!(payload, "returned");
    }

    #[tokio::test]
    async fn test_fetch_checks_queues_in_order() {
        let store = MemoryStore::new();
        store
            .push(&[queue_push("low", "l"), queue_push("high", "h")])
            .await
            .expect("push");

        let order = vec!["high".to_string(), "low".to_string()];
        let (queue, _) = store
            .fetch(&order, Duration::ZERO)
            .await
            .expect("fetch")
            .expect("job");
        assert_eq!(queue, "high");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_on_empty_queue() {
        let store = MemoryStore::new();
        let queues = vec!["default".to_string()];

        let started = Instant::now();
        let result = store
            .fetch(&queues, Duration::from_secs(2))
            .await
            .expect("fetch");

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_blocked_fetch_wakes_on_push() {
        let store = MemoryStore::new();
        let consumer = store.clone();
        let waiter = tokio::spawn(async move {
            consumer
                .fetch(&["default".to_string()], Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .push(&[queue_push("default", "late")])
            .await
            .expect("push");

        let fetched = waiter.await.expect("join").expect("fetch");
        assert_eq!(fetched, Some(("default".to_string(), "late".to_string())));
    }

    #[tokio::test]
    async fn test_due_members_respects_score_and_limit() {
        let store = MemoryStore::new();
        store.add_to_set(keys::RETRY, 30.0, "c").await.expect("zadd");
        store.add_to_set(keys::RETRY, 10.0, "a").await.expect("zadd");
        store.add_to_set(keys::RETRY, 20.0, "b").await.expect("zadd");

        let due = store.due_members(keys::RETRY, 20.0, 10).await.expect("due");
        assert_eq!(due, vec!["a", "b"]);

        let due = store.due_members(keys::RETRY, 100.0, 1).await.expect("due");
        assert_eq!(due, vec!["a"]);

        assert!(store.remove_from_set(keys::RETRY, "a").await.expect("zrem"));
        assert!(!store.remove_from_set(keys::RETRY, "a").await.expect("zrem"));
        assert_eq!(store.set_len(keys::RETRY).await.expect("zcard"), 2);
    }

    #[tokio::test]
    async fn test_kill_trims_old_and_excess_entries() {
        let store = MemoryStore::new();
        store.add_to_set(keys::DEAD, 1.0, "ancient").await.expect("zadd");
        store.add_to_set(keys::DEAD, 100.0, "x").await.expect("zadd");
        store.add_to_set(keys::DEAD, 101.0, "y").await.expect("zadd");

        store.kill("z", 102.0, 50.0, 2).await.expect("kill");

        let members: Vec<String> = store
            .set_range(keys::DEAD, 0, -1)
            .await
            .expect("range")
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["y", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_record_expires() {
        let store = MemoryStore::new();
        let beat = Beat {
            identity: "host:1:abc".to_string(),
            info: "{}".to_string(),
            busy: 1,
            beat: 1.0,
            rtt_us: 10,
            quiet: false,
            rss_kb: 0,
            work: vec![("w1".to_string(), "{}".to_string())],
            ttl: Duration::from_secs(60),
        };

        assert!(store.heartbeat(&beat).await.expect("beat").is_none());
        let fields = store
            .process_fields("host:1:abc")
            .await
            .expect("hgetall")
            .expect("record");
        assert_eq!(fields.get("busy").map(String::as_str), Some("1"));
        assert_eq!(fields.get("quiet").map(String::as_str), Some("false"));
        assert_eq!(store.process_work("host:1:abc").await.expect("work").len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(store.process_fields("host:1:abc").await.expect("hgetall").is_none());
        assert!(store.process_work("host:1:abc").await.expect("work").is_empty());
        // Membership outlives the record until cleanup prunes it.
        assert_eq!(
            store.process_identities().await.expect("smembers"),
            vec!["host:1:abc"]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_pops_signals_oldest_first() {
        let store = MemoryStore::new();
        store.send_signal("p", "TSTP").await.expect("signal");
        store.send_signal("p", "TERM").await.expect("signal");

        let beat = Beat {
            identity: "p".to_string(),
            info: "{}".to_string(),
            busy: 0,
            beat: 1.0,
            rtt_us: 0,
            quiet: false,
            rss_kb: 0,
            work: Vec::new(),
            ttl: Duration::from_secs(60),
        };
        assert_eq!(store.heartbeat(&beat).await.expect("beat").as_deref(), Some("TSTP"));
        assert_eq!(store.heartbeat(&beat).await.expect("beat").as_deref(), Some("TERM"));
        assert_eq!(store.heartbeat(&beat).await.expect("beat"), None);
    }

    #[tokio::test]
    async fn test_increment_stats_and_counters() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(3600);
        store
            .increment_stats(3, 1, "2024-03-01", ttl)
            .await
            .expect("incr");
        store
            .increment_stats(2, 0, "2024-03-01", ttl)
            .await
            .expect("incr");

        let values = store
            .counters(&[
                keys::STAT_PROCESSED.to_string(),
                keys::STAT_FAILED.to_string(),
                keys::daily_processed("2024-03-01"),
                "missing".to_string(),
            ])
            .await
            .expect("mget");
        assert_eq!(values, vec![5, 1, 5, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lock("lock", ttl).await.expect("set"));
        assert!(!store.acquire_lock("lock", ttl).await.expect("set"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.acquire_lock("lock", ttl).await.expect("set"));
    }

    #[tokio::test]
    async fn test_fault_injection_and_round_trips() {
        let store = MemoryStore::new();
        store.fail_next(1);

        assert!(matches!(
            store.ping().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.ping().await.is_ok());
        assert_eq!(store.round_trips(), 2);
    }
}
