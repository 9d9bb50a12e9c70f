//! Integration tests against a live redis server.
//!
//! These tests flush the selected database.
//! Run with: REDIS_URL=redis://127.0.0.1:6379/15 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use jobforge::api::{JobSet, ProcessSet, QueueView, Stats};
use jobforge::store::{keys, Beat, Push};
use jobforge::{Client, JobDescriptor, RedisStore, Store};

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

async fn fresh_store() -> Arc<dyn Store> {
    let url = redis_url();
    let client = redis::Client::open(url.as_str()).expect("valid url");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("connects");
    redis::cmd("FLUSHDB")
        .query_async::<_, ()>(&mut conn)
        .await
        .expect("flushdb");

    Arc::new(
        RedisStore::connect(&url, 2, Duration::from_secs(1))
            .await
            .expect("store connects"),
    )
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_push_fetch_roundtrip() {
    let store = fresh_store().await;
    store.ping().await.expect("ping");

    let client = Client::new(Arc::clone(&store));
    let jid = client
        .push(JobDescriptor::new("Echo", ["hi"]).expect("valid job").with_queue("mailers"))
        .await
        .expect("push")
        .expect("jid");

    assert_eq!(store.queue_names().await.expect("smembers"), vec!["mailers"]);
    let (queue, payload) = store
        .fetch(&["mailers".to_string()], Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("work");
    assert_eq!(queue, "mailers");
    assert_eq!(JobDescriptor::from_json(&payload).expect("valid").jid, jid);

    let empty = store
        .fetch(&["mailers".to_string()], Duration::from_secs(1))
        .await
        .expect("fetch");
    assert!(empty.is_none());
}

#[tokio::test]
#[ignore]
async fn test_sorted_sets_and_api() {
    let store = fresh_store().await;
    let now = 1_700_000_000.0;

    store
        .push(&[
            Push::Schedule {
                at: now - 1.0,
                payload: JobDescriptor::new("Echo", [1])
                    .expect("valid job")
                    .with_jid("due")
                    .to_json()
                    .expect("json"),
            },
            Push::Schedule {
                at: now + 60.0,
                payload: JobDescriptor::new("Echo", [2])
                    .expect("valid job")
                    .with_jid("later")
                    .to_json()
                    .expect("json"),
            },
        ])
        .await
        .expect("push");

    let due = store.due_members(keys::SCHEDULE, now, 100).await.expect("due");
    assert_eq!(due.len(), 1);
    assert!(store.remove_from_set(keys::SCHEDULE, &due[0]).await.expect("zrem"));
    assert!(!store.remove_from_set(keys::SCHEDULE, &due[0]).await.expect("zrem"));

    let scheduled = JobSet::scheduled(Arc::clone(&store));
    assert_eq!(scheduled.size().await.expect("size"), 1);
    let later = scheduled.find_job("later").await.expect("find").expect("present");
    assert_eq!(later.score, now + 60.0);

    assert!(QueueView::all(&store).await.expect("queues").is_empty());
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_stats_and_signals() {
    let store = fresh_store().await;
    let beat = Beat {
        identity: "itest:1:abc".to_string(),
        info: serde_json::json!({
            "hostname": "itest",
            "started_at": 1.0,
            "pid": 1,
            "concurrency": 4,
            "queues": ["default"],
            "identity": "itest:1:abc",
            "version": "0.1.0",
        })
        .to_string(),
        busy: 0,
        beat: 2.0,
        rtt_us: 10,
        quiet: false,
        rss_kb: 0,
        work: Vec::new(),
        ttl: Duration::from_secs(60),
    };
    assert!(store.heartbeat(&beat).await.expect("beat").is_none());

    store
        .increment_stats(3, 1, "2023-11-14", Duration::from_secs(3600))
        .await
        .expect("incr");
    let stats = Stats::fetch(&store, 1_700_000_000.0).await.expect("stats");
    assert_eq!((stats.processed, stats.failed), (3, 1));
    assert_eq!(stats.processes_size, 1);

    let processes = ProcessSet::new(Arc::clone(&store));
    let process = processes.get("itest:1:abc").await.expect("get").expect("live");
    assert_eq!(process.info.concurrency, 4);
    process.stop().await.expect("signal");
    assert_eq!(store.heartbeat(&beat).await.expect("beat").as_deref(), Some("TERM"));

    store.clear_process("itest:1:abc").await.expect("clear");
    assert!(processes.get("itest:1:abc").await.expect("get").is_none());
}
