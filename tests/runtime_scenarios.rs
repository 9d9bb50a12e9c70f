//! End-to-end runtime scenarios against the in-memory store.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use jobforge::api::{JobSet, ProcessSet};
use jobforge::clock::{Clock, ManualClock};
use jobforge::launcher::{Capsule, ChannelDelivery, IgnoreSignals, SignalDelivery};
use jobforge::scheduled::Poller;
use jobforge::store::{keys, Push};
use jobforge::{
    CapsuleConfig, JobDescriptor, JobOptions, JobRegistry, Launcher, LauncherState, MemoryStore,
    RuntimeConfig, RuntimeContext, Signal, Store, Worker,
};

const NOW: f64 = 1_700_000_000.0;

/// Records the jid of every job it runs.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Worker for Recorder {
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        self.seen.lock().expect("lock").push(job.jid.clone());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl Worker for Failing {
    async fn perform(&self, _job: &JobDescriptor) -> anyhow::Result<()> {
        anyhow::bail!("upstream unavailable")
    }
}

struct Sleeping;

#[async_trait]
impl Worker for Sleeping {
    async fn perform(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        let secs = job.args.first().and_then(|v| v.as_u64()).unwrap_or(1);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(())
    }
}

fn registry(recorder: &Recorder) -> JobRegistry {
    JobRegistry::new()
        .with("Record", JobOptions::default(), recorder.clone())
        .with("Fail", JobOptions::default(), Failing)
        .with("Sleep", JobOptions::default(), Sleeping)
}

fn context(store: &MemoryStore, recorder: &Recorder, timeout: Duration) -> RuntimeContext {
    let config = RuntimeConfig::default()
        .with_fetch_timeout(Duration::from_millis(100))
        .with_timeout(timeout);
    RuntimeContext::new(config, Arc::new(store.clone()))
        .with_registry(registry(recorder))
        .with_identity("worker-1:42:abc")
}

fn launcher(ctx: RuntimeContext, store: &MemoryStore, signals: Arc<dyn SignalDelivery>) -> Launcher {
    launcher_with_concurrency(ctx, store, signals, 2)
}

fn launcher_with_concurrency(
    ctx: RuntimeContext,
    store: &MemoryStore,
    signals: Arc<dyn SignalDelivery>,
    concurrency: usize,
) -> Launcher {
    let capsule = Capsule::new(
        CapsuleConfig::new("default", concurrency),
        Arc::new(store.clone()),
    );
    Launcher::new(ctx, vec![capsule], signals)
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn totals(store: &MemoryStore) -> (u64, u64) {
    let values = store
        .counters(&[keys::STAT_PROCESSED.to_string(), keys::STAT_FAILED.to_string()])
        .await
        .expect("counters");
    (values[0], values[1])
}

#[tokio::test(start_paused = true)]
async fn test_enqueued_job_is_processed() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(5));
    let client = ctx.client();
    let launcher = launcher(ctx, &store, Arc::new(IgnoreSignals));
    launcher.run().await.expect("runs");

    let job = JobDescriptor::new("Record", [1, 2]).expect("valid job");
    let jid = client.push(job).await.expect("push").expect("jid");

    let watched = recorder.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { !watched.seen().is_empty() }
    })
    .await;

    assert_eq!(launcher.stop().await, 0);
    assert_eq!(recorder.seen(), vec![jid]);
    assert_eq!(store.queue_len("default").await.expect("llen"), 0);
    assert_eq!(totals(&store).await, (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_single_processor_runs_jobs_in_push_order() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(5));
    let client = ctx.client();

    let mut pushed = Vec::new();
    for i in 0..3 {
        let jid = client
            .push(JobDescriptor::new("Record", [i]).expect("valid job"))
            .await
            .expect("push")
            .expect("jid");
        pushed.push(jid);
    }

    let launcher = launcher_with_concurrency(ctx, &store, Arc::new(IgnoreSignals), 1);
    launcher.run().await.expect("runs");

    let watched = recorder.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.seen().len() == 3 }
    })
    .await;

    assert_eq!(launcher.stop().await, 0);
    assert_eq!(recorder.seen(), pushed);
    assert_eq!(store.queue_len("default").await.expect("llen"), 0);
    assert_eq!(totals(&store).await, (3, 0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_lands_in_retry_set() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let ctx = context(&store, &recorder, Duration::from_secs(5)).with_clock(clock);
    let client = ctx.client();
    let launcher = launcher(ctx, &store, Arc::new(IgnoreSignals));
    launcher.run().await.expect("runs");

    let jid = client
        .push(JobDescriptor::new("Fail", ["x"]).expect("valid job"))
        .await
        .expect("push")
        .expect("jid");

    let watched = store.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.set_len(keys::RETRY).await.unwrap_or(0) == 1 }
    })
    .await;
    launcher.stop().await;

    let retries = JobSet::retries(Arc::new(store.clone()));
    let entry = retries.find_job(&jid).await.expect("find").expect("in retry set");
    let job = entry.item().expect("parses");
    assert_eq!(job.retry_count, Some(0));
    assert_eq!(job.error_class.as_deref(), Some("JobFailed"));
    assert_eq!(job.error_message.as_deref(), Some("upstream unavailable"));
    assert_eq!(job.failed_at, Some(NOW));
    assert!(entry.score > NOW);
    assert_eq!(store.queue_len("default").await.expect("llen"), 0);
    assert_eq!(totals(&store).await, (1, 1));
}

#[tokio::test]
async fn test_poller_promotes_due_retry() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let ctx = context(&store, &recorder, Duration::from_secs(5)).with_clock(Arc::clone(&clock));

    let mut due = JobDescriptor::new("Record", [1]).expect("valid job").with_jid("due");
    due.retry_count = Some(0);
    let later = JobDescriptor::new("Record", [2]).expect("valid job").with_jid("later");
    store
        .add_to_set(keys::RETRY, NOW - 1.0, &due.to_json().expect("json"))
        .await
        .expect("zadd");
    store
        .add_to_set(keys::RETRY, NOW + 60.0, &later.to_json().expect("json"))
        .await
        .expect("zadd");

    let poller = Poller::new(ctx);
    assert_eq!(poller.enqueue_jobs().await.expect("poll"), 1);

    assert_eq!(store.set_len(keys::RETRY).await.expect("zcard"), 1);
    let queued = store.queue_range("default", 0, -1).await.expect("lrange");
    let job = JobDescriptor::from_json(&queued[0]).expect("valid");
    assert_eq!(job.jid, "due");
    assert_eq!(job.retry_count, Some(0));
    assert_eq!(job.enqueued_at, Some(NOW));
}

#[tokio::test]
async fn test_due_boundary_is_inclusive() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let ctx = context(&store, &recorder, Duration::from_secs(5)).with_clock(Arc::clone(&clock));
    let client = ctx.client();

    // A job scheduled for exactly now goes straight to its queue.
    client
        .push(JobDescriptor::new("Record", [1]).expect("valid job").with_at(NOW))
        .await
        .expect("push");
    assert_eq!(store.queue_len("default").await.expect("llen"), 1);
    assert_eq!(store.set_len(keys::SCHEDULE).await.expect("zcard"), 0);

    let on_time = JobDescriptor::new("Record", [2]).expect("valid job");
    store
        .add_to_set(keys::SCHEDULE, NOW, &on_time.to_json().expect("json"))
        .await
        .expect("zadd");
    let early = JobDescriptor::new("Record", [3]).expect("valid job");
    store
        .add_to_set(keys::SCHEDULE, NOW + 0.001, &early.to_json().expect("json"))
        .await
        .expect("zadd");

    assert_eq!(Poller::new(ctx).enqueue_jobs().await.expect("poll"), 1);
    assert_eq!(store.queue_len("default").await.expect("llen"), 2);
    assert_eq!(store.set_len(keys::SCHEDULE).await.expect("zcard"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_pollers_enqueue_each_job_once() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));

    for i in 0..250 {
        let job = JobDescriptor::new("Record", [i])
            .expect("valid job")
            .with_jid(format!("job-{i}"));
        store
            .add_to_set(keys::SCHEDULE, NOW - 10.0, &job.to_json().expect("json"))
            .await
            .expect("zadd");
    }

    let first = Arc::new(Poller::new(
        context(&store, &recorder, Duration::from_secs(5)).with_clock(Arc::clone(&clock)),
    ));
    let second = Arc::new(Poller::new(
        context(&store, &recorder, Duration::from_secs(5)).with_clock(Arc::clone(&clock)),
    ));

    let a = tokio::spawn({
        let poller = Arc::clone(&first);
        async move { poller.enqueue_jobs().await.expect("poll") }
    });
    let b = tokio::spawn({
        let poller = Arc::clone(&second);
        async move { poller.enqueue_jobs().await.expect("poll") }
    });
    let moved = a.await.expect("join") + b.await.expect("join");

    assert_eq!(moved, 250);
    assert_eq!(store.queue_len("default").await.expect("llen"), 250);
    assert_eq!(store.set_len(keys::SCHEDULE).await.expect("zcard"), 0);

    let mut jids: Vec<String> = store
        .queue_range("default", 0, -1)
        .await
        .expect("lrange")
        .iter()
        .map(|raw| JobDescriptor::from_json(raw).expect("valid").jid)
        .collect();
    jids.sort();
    jids.dedup();
    assert_eq!(jids.len(), 250);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_waits_for_running_job() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(10));
    let client = ctx.client();
    let work_state = ctx.work_state.clone();
    let launcher = launcher(ctx, &store, Arc::new(IgnoreSignals));
    launcher.run().await.expect("runs");

    client
        .push(JobDescriptor::new("Sleep", [3]).expect("valid job"))
        .await
        .expect("push");
    let watched = work_state.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.len() == 1 }
    })
    .await;

    assert_eq!(launcher.stop().await, 0);
    assert_eq!(launcher.state(), LauncherState::Stopped);
    assert!(work_state.is_empty());
    assert_eq!(store.queue_len("default").await.expect("llen"), 0);
    assert_eq!(totals(&store).await, (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_hard_shutdown_requeues_unfinished_job() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(1));
    let client = ctx.client();
    let work_state = ctx.work_state.clone();
    let launcher = launcher(ctx, &store, Arc::new(IgnoreSignals));
    launcher.run().await.expect("runs");

    let jid = client
        .push(JobDescriptor::new("Sleep", [300]).expect("valid job"))
        .await
        .expect("push")
        .expect("jid");
    let watched = work_state.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.len() == 1 }
    })
    .await;

    assert_eq!(launcher.stop().await, 1);
    assert!(work_state.is_empty());

    let queued = store.queue_range("default", 0, -1).await.expect("lrange");
    assert_eq!(queued.len(), 1);
    assert_eq!(JobDescriptor::from_json(&queued[0]).expect("valid").jid, jid);
    assert_eq!(totals(&store).await, (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_quiet_stops_fetching() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(5));
    let client = ctx.client();
    let launcher = launcher(ctx, &store, Arc::new(IgnoreSignals));
    launcher.run().await.expect("runs");

    assert!(launcher.quiet().await);
    assert!(!launcher.quiet().await);
    // Let processors finish their in-flight fetch.
    tokio::time::sleep(Duration::from_secs(1)).await;

    client
        .push(JobDescriptor::new("Record", [1]).expect("valid job"))
        .await
        .expect("push");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(recorder.seen().is_empty());
    assert_eq!(store.queue_len("default").await.expect("llen"), 1);
    launcher.stop().await;
    assert_eq!(store.queue_len("default").await.expect("llen"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_signal_reaches_launcher_via_heartbeat() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let ctx = context(&store, &recorder, Duration::from_secs(5));
    let (delivery, mut signals) = ChannelDelivery::new();
    let launcher = launcher(ctx, &store, Arc::new(delivery));
    launcher.run().await.expect("runs");

    let processes = ProcessSet::new(Arc::new(store.clone()));
    let watched = processes.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.size().await.unwrap_or(0) == 1 }
    })
    .await;

    let process = processes
        .get("worker-1:42:abc")
        .await
        .expect("get")
        .expect("registered");
    process.quiet().await.expect("send quiet");

    let signal = tokio::time::timeout(Duration::from_secs(30), signals.recv())
        .await
        .expect("delivered before timeout")
        .expect("channel open");
    assert_eq!(signal, Signal::Quiet);

    launcher.handle_signal(signal).await;
    assert_eq!(launcher.state(), LauncherState::Quiet);

    // The next heartbeat reports the quiet flag.
    tokio::time::sleep(Duration::from_secs(11)).await;
    let process = processes
        .get("worker-1:42:abc")
        .await
        .expect("get")
        .expect("registered");
    assert!(process.is_stopping());

    launcher.handle_signal(Signal::Stop).await;
    assert_eq!(launcher.state(), LauncherState::Stopped);
    assert!(processes.get("worker-1:42:abc").await.expect("get").is_none());
}

#[tokio::test]
async fn test_bulk_push_uses_one_round_trip_per_batch() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let client = context(&store, &recorder, Duration::from_secs(5)).client();

    let jobs: Vec<JobDescriptor> = (0..250)
        .map(|i| JobDescriptor::new("Record", [i]).expect("valid job"))
        .collect();
    let before = store.round_trips();
    let jids = client.push_bulk(jobs, 100).await.expect("bulk push");

    assert_eq!(store.round_trips() - before, 3);
    assert_eq!(jids.len(), 250);
    assert!(jids.iter().all(Option::is_some));
    assert_eq!(store.queue_len("default").await.expect("llen"), 250);
}

#[tokio::test]
async fn test_unparsable_scheduled_member_goes_to_dead_set() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let ctx = context(&store, &recorder, Duration::from_secs(5)).with_clock(clock);

    store
        .push(&[Push::Schedule {
            at: NOW - 5.0,
            payload: "{not json".to_string(),
        }])
        .await
        .expect("zadd");

    assert_eq!(Poller::new(ctx).enqueue_jobs().await.expect("poll"), 0);
    assert_eq!(store.set_len(keys::SCHEDULE).await.expect("zcard"), 0);
    assert_eq!(store.set_len(keys::DEAD).await.expect("zcard"), 1);
}
