//! Liveness reporting and remote signal pickup.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::context::{hostname, RuntimeContext};
use super::signal::{Signal, SignalDelivery};
use crate::clock::day_stamp;
use crate::config::CapsuleConfig;
use crate::metrics::MetricsCollector;
use crate::store::{Beat, StoreError};

/// Lifetime of the process record and work hash.
pub const PROCESS_TTL: Duration = Duration::from_secs(60);

/// Lifetime of the per-day stat counters.
pub const STATS_TTL: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

const RTT_SAMPLES: usize = 5;
const RTT_WARNING_US: u64 = 50_000;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Process metadata published in the `info` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub hostname: String,
    pub started_at: f64,
    pub pid: u32,
    #[serde(default)]
    pub tag: Option<String>,
    pub concurrency: usize,
    pub queues: Vec<String>,
    /// One queue → weight map per capsule.
    #[serde(default)]
    pub weights: Vec<BTreeMap<String, u32>>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub identity: String,
    pub version: String,
    #[serde(default)]
    pub embedded: bool,
}

impl ProcessInfo {
    pub fn new(ctx: &RuntimeContext, capsules: &[CapsuleConfig]) -> Self {
        let mut queues: Vec<String> = Vec::new();
        for name in capsules.iter().flat_map(CapsuleConfig::queue_names) {
            if !queues.contains(&name) {
                queues.push(name);
            }
        }

        Self {
            hostname: hostname(),
            started_at: ctx.started_at,
            pid: std::process::id(),
            tag: ctx.config.tag.clone(),
            concurrency: capsules.iter().map(|c| c.concurrency).sum(),
            queues,
            weights: capsules
                .iter()
                .map(|c| c.queues.iter().map(|q| (q.name.clone(), q.weight)).collect())
                .collect(),
            labels: ctx.config.labels.clone(),
            identity: ctx.identity.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            embedded: false,
        }
    }
}

/// Ring of the last round-trip samples.
#[derive(Debug, Default)]
pub struct RttMonitor {
    samples: VecDeque<u64>,
}

impl RttMonitor {
    /// Adds a sample; true when the ring is full and every sample is above
    /// the warning threshold. The ring is cleared in that case.
    pub fn record(&mut self, rtt_us: u64) -> bool {
        self.samples.push_back(rtt_us);
        if self.samples.len() > RTT_SAMPLES {
            self.samples.pop_front();
        }

        let slow = self.samples.len() == RTT_SAMPLES
            && self.samples.iter().all(|&s| s > RTT_WARNING_US);
        if slow {
            self.samples.clear();
        }
        slow
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub struct Heartbeat {
    ctx: RuntimeContext,
    info: ProcessInfo,
    quiet: Arc<AtomicBool>,
    signals: Arc<dyn SignalDelivery>,
    rtt: Mutex<RttMonitor>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("identity", &self.ctx.identity)
            .field("quiet", &self.quiet.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    pub fn new(
        ctx: RuntimeContext,
        info: ProcessInfo,
        quiet: Arc<AtomicBool>,
        signals: Arc<dyn SignalDelivery>,
    ) -> Self {
        Self {
            ctx,
            info,
            quiet,
            signals,
            rtt: Mutex::new(RttMonitor::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    /// Writes one heartbeat; returns the popped remote signal, if any.
    pub async fn beat(&self) -> Result<Option<String>, HeartbeatError> {
        let store = &self.ctx.store;

        // Counters stay pending for the next beat; the record is still written.
        if let Err(e) = self.flush_stats().await {
            warn!(identity = %self.ctx.identity, error = %e, "Failed to flush stats");
        }

        let started = Instant::now();
        store.ping().await?;
        let rtt_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.record_rtt(rtt_us);

        let snapshot = self.ctx.work_state.snapshot();
        let mut work = Vec::with_capacity(snapshot.len());
        for (worker_id, entry) in &snapshot {
            work.push((worker_id.clone(), serde_json::to_string(entry)?));
        }

        let beat = Beat {
            identity: self.ctx.identity.clone(),
            info: serde_json::to_string(&self.info)?,
            busy: snapshot.len(),
            beat: self.ctx.clock.now(),
            rtt_us,
            quiet: self.quiet.load(Ordering::SeqCst),
            rss_kb: rss_kb(),
            work,
            ttl: PROCESS_TTL,
        };

        Ok(store.heartbeat(&beat).await?)
    }

    /// Beats immediately, then every heartbeat interval until `stop_rx`
    /// flips. Failures are logged and retried on the next tick.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        let interval = self.ctx.config.heartbeat_interval();
        info!(
            identity = %self.ctx.identity,
            interval_secs = interval.as_secs(),
            "Heartbeat started"
        );

        loop {
            match self.beat().await {
                Ok(Some(raw)) => self.dispatch(&raw),
                Ok(None) => {}
                Err(e) => error!(identity = %self.ctx.identity, error = %e, "Heartbeat failed"),
            }

            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *stop_rx.borrow() {
                break;
            }
        }

        debug!(identity = %self.ctx.identity, "Heartbeat stopped");
    }

    /// Flushes counters and removes this process's records.
    pub async fn clear(&self) -> Result<(), HeartbeatError> {
        self.flush_stats().await?;
        self.ctx.store.clear_process(&self.ctx.identity).await?;
        Ok(())
    }

    fn dispatch(&self, raw: &str) {
        match raw.parse::<Signal>() {
            Ok(signal) => {
                info!(identity = %self.ctx.identity, %signal, "Received remote signal");
                self.signals.deliver(signal);
            }
            Err(e) => warn!(identity = %self.ctx.identity, error = %e, "Ignoring remote signal"),
        }
    }

    async fn flush_stats(&self) -> Result<(), StoreError> {
        let (processed, failed) = self.ctx.counters.take();
        if processed == 0 && failed == 0 {
            return Ok(());
        }

        let day = day_stamp(self.ctx.clock.now());
        if let Err(e) = self
            .ctx
            .store
            .increment_stats(processed, failed, &day, STATS_TTL)
            .await
        {
            self.ctx.counters.restore(processed, failed);
            return Err(e);
        }
        Ok(())
    }

    fn record_rtt(&self, rtt_us: u64) {
        self.metrics.record_heartbeat_rtt(rtt_us);
        let slow = self
            .rtt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(rtt_us);
        if slow {
            warn!(
                identity = %self.ctx.identity,
                rtt_us,
                threshold_us = RTT_WARNING_US,
                "Store round trips are consistently slow"
            );
        }
    }
}

/// Resident set size in KiB, 0 where unavailable.
pub fn rss_kb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{QueueWeight, RuntimeConfig};
    use crate::launcher::WorkEntry;
    use crate::store::{keys, MemoryStore, Store};

    const NOW: f64 = 1_700_000_000.0;

    #[derive(Default)]
    struct Captured(StdMutex<Vec<Signal>>);

    impl SignalDelivery for Captured {
        fn deliver(&self, signal: Signal) {
            self.0.lock().unwrap().push(signal);
        }
    }

    fn heartbeat(store: &MemoryStore) -> (Heartbeat, RuntimeContext, Arc<Captured>) {
        let capsules = vec![
            CapsuleConfig::new("default", 5),
            CapsuleConfig::new("bulk", 2).with_queues(vec![
                QueueWeight::new("bulk", 3),
                QueueWeight::new("default", 1),
            ]),
        ];
        let ctx = RuntimeContext::new(
            RuntimeConfig::default().with_tag("billing"),
            Arc::new(store.clone()),
        )
        .with_clock(Arc::new(ManualClock::new(NOW)))
        .with_identity("host:1:abc");
        let info = ProcessInfo::new(&ctx, &capsules);
        let captured = Arc::new(Captured::default());
        let hb = Heartbeat::new(
            ctx.clone(),
            info,
            Arc::new(AtomicBool::new(false)),
            captured.clone(),
        );
        (hb, ctx, captured)
    }

    #[test]
    fn test_rtt_monitor_warns_after_five_slow_samples() {
        let mut monitor = RttMonitor::default();
        for _ in 0..4 {
            assert!(!monitor.record(60_000));
        }
        assert!(monitor.record(60_000));
        assert!(monitor.is_empty());

        for _ in 0..4 {
            monitor.record(60_000);
        }
        assert!(!monitor.record(10));
        assert_eq!(monitor.len(), 5);
        for _ in 0..4 {
            assert!(!monitor.record(60_000));
        }
        assert!(monitor.record(60_000));
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tjobforge\nVmPeak:\t  9000 kB\nVmRSS:\t  4321 kB\n";
        assert_eq!(parse_vm_rss(status), Some(4321));
        assert_eq!(parse_vm_rss("Name:\tjobforge\n"), None);
    }

    #[tokio::test]
    async fn test_process_info_lists_capsules() {
        let (hb, _, _) = heartbeat(&MemoryStore::new());
        let info = hb.info();
        assert_eq!(info.identity, "host:1:abc");
        assert_eq!(info.concurrency, 7);
        assert_eq!(info.queues, vec!["default", "bulk"]);
        assert_eq!(info.weights[1]["bulk"], 3);
        assert_eq!(info.tag.as_deref(), Some("billing"));
        assert_eq!(info.started_at, NOW);
    }

    #[tokio::test]
    async fn test_beat_writes_record_and_flushes_counters() {
        let store = MemoryStore::new();
        let (hb, ctx, _) = heartbeat(&store);

        ctx.counters.record_processed();
        ctx.counters.record_processed();
        ctx.counters.record_failed();
        ctx.work_state.register(
            "default-0",
            WorkEntry {
                queue: "default".to_string(),
                payload: "{}".to_string(),
                run_at: NOW,
            },
        );

        assert_eq!(hb.beat().await.expect("beat"), None);
        assert_eq!(ctx.counters.peek(), (0, 0));

        let fields = store
            .process_fields("host:1:abc")
            .await
            .expect("hgetall")
            .expect("record exists");
        assert_eq!(fields["busy"], "1");
        assert_eq!(fields["quiet"], "false");
        let info: ProcessInfo = serde_json::from_str(&fields["info"]).expect("info json");
        assert_eq!(info.identity, "host:1:abc");

        let work = store.process_work("host:1:abc").await.expect("work");
        assert!(work.contains_key("default-0"));

        let keys_to_read = vec![
            keys::STAT_PROCESSED.to_string(),
            keys::STAT_FAILED.to_string(),
            keys::daily_processed(&day_stamp(NOW)),
        ];
        assert_eq!(
            store.counters(&keys_to_read).await.expect("get"),
            vec![2, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_failed_flush_restores_counters() {
        let store = MemoryStore::new();
        let (hb, ctx, _) = heartbeat(&store);
        ctx.counters.record_processed();

        store.fail_next(1);
        assert!(hb.flush_stats().await.is_err());
        assert_eq!(ctx.counters.peek(), (1, 0));

        hb.beat().await.expect("beat");
        assert_eq!(ctx.counters.peek(), (0, 0));
    }

    #[tokio::test]
    async fn test_beat_survives_failed_flush() {
        let store = MemoryStore::new();
        let (hb, ctx, _) = heartbeat(&store);
        ctx.counters.record_processed();
        ctx.counters.record_failed();

        store.fail_next(1);
        hb.beat().await.expect("beat despite flush failure");
        assert_eq!(ctx.counters.peek(), (1, 1));
        assert_eq!(
            store.process_identities().await.expect("smembers"),
            vec!["host:1:abc"]
        );
        let fields = store
            .process_fields("host:1:abc")
            .await
            .expect("hgetall")
            .expect("record");
        assert!(fields.contains_key("info"));

        hb.beat().await.expect("beat");
        assert_eq!(ctx.counters.peek(), (0, 0));
        let totals = store
            .counters(&[keys::STAT_PROCESSED.to_string(), keys::STAT_FAILED.to_string()])
            .await
            .expect("counters");
        assert_eq!(totals, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_delivers_remote_signals() {
        let store = MemoryStore::new();
        let (hb, _, captured) = heartbeat(&store);
        let hb = Arc::new(hb);

        store.send_signal("host:1:abc", "TSTP").await.expect("lpush");
        store.send_signal("host:1:abc", "BOGUS").await.expect("lpush");

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let hb = Arc::clone(&hb);
            tokio::spawn(async move { hb.run(stop_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        stop_tx.send_replace(true);
        runner.await.expect("heartbeat exits");

        assert_eq!(*captured.0.lock().unwrap(), vec![Signal::Quiet]);
    }

    #[tokio::test]
    async fn test_clear_removes_process() {
        let store = MemoryStore::new();
        let (hb, ctx, _) = heartbeat(&store);
        hb.beat().await.expect("beat");
        ctx.counters.record_failed();

        hb.clear().await.expect("clear");

        assert!(store.process_identities().await.expect("smembers").is_empty());
        assert!(store
            .process_fields("host:1:abc")
            .await
            .expect("hgetall")
            .is_none());
        assert_eq!(
            store
                .counters(&[keys::STAT_FAILED.to_string()])
                .await
                .expect("get"),
            vec![1]
        );
    }
}
