//! CLI command definitions for jobforge.
//!
//! `run` boots a worker process; the remaining commands are thin operator
//! tools over the inspection API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use super::builtin_jobs::builtin_registry;
use crate::api::{JobSet, ProcessSet, Stats, WorkSet};
use crate::client::Client;
use crate::clock::{epoch_seconds, Clock, SystemClock};
use crate::config::{QueueWeight, RuntimeConfig};
use crate::job::{JobDescriptor, RetryPolicy};
use crate::launcher::{ChannelDelivery, Launcher, RuntimeContext, Signal};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::middleware::{ClientChain, ClientMetrics, JobLogger, ServerChain, ServerMetrics};
use crate::store::{RedisStore, Store};

/// Background job runtime backed by redis.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Run and operate redis-backed background job workers")]
#[command(version)]
#[command(
    long_about = "jobforge fetches jobs from redis queues and runs them on a pool of async workers.\n\nFailed jobs are retried with exponential backoff; scheduled jobs are promoted when due.\n\nExample usage:\n  jobforge run -c 10 -q critical,2 -q default\n  jobforge enqueue Echo --args '[\"hello\"]'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override it.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Redis URL; overrides the configuration file and environment.
    #[arg(long, global = true, value_name = "URL")]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start a worker process and run until stopped.
    Run(RunArgs),

    /// Push one job.
    #[command(alias = "push")]
    Enqueue(EnqueueArgs),

    /// Show cluster counters, set sizes and queue depths.
    Stats(StatsArgs),

    /// List live processes.
    #[command(alias = "ps")]
    Processes(ProcessesArgs),

    /// Send quiet, stop or dump to a live process.
    Signal(SignalArgs),

    /// Push every job in the retry, dead or scheduled set back onto its queue.
    RetryAll(RetryAllArgs),
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Processors in the default capsule.
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Queue for the default capsule as `name[,weight]`. Repeatable.
    #[arg(short = 'q', long = "queue", value_name = "NAME[,WEIGHT]")]
    pub queues: Vec<QueueWeight>,

    /// Seconds to wait for in-flight jobs on shutdown.
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Tag shown next to this process in listings.
    #[arg(long)]
    pub tag: Option<String>,

    /// Print the Prometheus metrics text after shutdown.
    #[arg(long)]
    pub dump_metrics: bool,
}

impl RunArgs {
    /// Applies the flags on top of the loaded configuration.
    pub fn apply_to(&self, config: &mut RuntimeConfig) {
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(tag) = &self.tag {
            config.tag = Some(tag.clone());
        }
        if self.concurrency.is_none() && self.queues.is_empty() {
            return;
        }

        if config.capsules.is_empty() {
            config.capsules.push(Default::default());
        }
        let capsule = &mut config.capsules[0];
        if let Some(concurrency) = self.concurrency {
            capsule.concurrency = concurrency;
        }
        if !self.queues.is_empty() {
            capsule.queues = self.queues.clone();
        }
    }
}

/// Arguments for the `enqueue` command.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Registered job class.
    pub class: String,

    /// Job arguments as a JSON array.
    #[arg(short, long, default_value = "[]")]
    pub args: String,

    /// Target queue.
    #[arg(short, long, default_value = "default")]
    pub queue: String,

    /// Run after this many seconds.
    #[arg(long = "in", value_name = "SECONDS", conflicts_with = "at")]
    pub delay: Option<f64>,

    /// Run at this time: unix seconds or an RFC 3339 timestamp.
    #[arg(long, value_parser = parse_timestamp)]
    pub at: Option<f64>,

    /// Retry limit; 0 disables retries.
    #[arg(long)]
    pub retry: Option<u32>,
}

impl EnqueueArgs {
    /// Builds the descriptor to push, relative to `now`.
    pub fn descriptor(&self, now: f64) -> anyhow::Result<JobDescriptor> {
        let args: Value = serde_json::from_str(&self.args)
            .with_context(|| format!("--args is not valid JSON: {}", self.args))?;
        let mut job = JobDescriptor::new(&self.class, args)?.with_queue(&self.queue);

        if let Some(limit) = self.retry {
            job = job.with_retry(if limit == 0 {
                RetryPolicy::Enabled(false)
            } else {
                RetryPolicy::Limit(limit)
            });
        }

        if let Some(delay) = self.delay {
            if !(delay.is_finite() && delay >= 0.0) {
                bail!("--in must be a non-negative number of seconds");
            }
            job = job.with_at(now + delay);
        } else if let Some(at) = self.at {
            job = job.with_at(at);
        }
        Ok(job)
    }
}

/// Arguments for the `stats` command.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Also show per-day counters for this many days.
    #[arg(long, value_name = "DAYS")]
    pub history: Option<u32>,

    /// Output in JSON format.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for the `processes` command.
#[derive(Parser, Debug)]
pub struct ProcessesArgs {
    /// Also list in-flight jobs.
    #[arg(short, long)]
    pub work: bool,
}

/// Arguments for the `signal` command.
#[derive(Parser, Debug)]
pub struct SignalArgs {
    /// Process identity as shown by `processes`.
    pub identity: String,

    /// One of quiet, stop or dump (OS names like TSTP also work).
    pub signal: Signal,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetName {
    Retry,
    Dead,
    Scheduled,
}

/// Arguments for the `retry-all` command.
#[derive(Parser, Debug)]
pub struct RetryAllArgs {
    /// Set to drain.
    #[arg(long, value_enum, default_value = "retry")]
    pub set: SetName,
}

fn parse_timestamp(raw: &str) -> Result<f64, String> {
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() {
            return Ok(secs);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| epoch_seconds(at.with_timezone(&Utc)))
        .map_err(|e| format!("expected unix seconds or RFC 3339, got '{raw}': {e}"))
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI, parsing arguments from the command line.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli).await
}

/// Run the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref(), cli.redis_url.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            args.apply_to(&mut config);
            config.validate()?;
            run_worker_command(config, args.dump_metrics).await
        }
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args).await,
        Commands::Processes(args) => run_processes_command(&config, args).await,
        Commands::Signal(args) => run_signal_command(&config, args).await,
        Commands::RetryAll(args) => run_retry_all_command(&config, args).await,
    }
}

/// File (if any), then environment, then `--redis-url`.
fn load_config(path: Option<&Path>, redis_url: Option<&str>) -> anyhow::Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config.apply_env()?;
    if let Some(url) = redis_url {
        config.redis_url = url.to_string();
    }
    Ok(config)
}

async fn connect_store(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store = RedisStore::connect(
        &config.redis_url,
        config.pool_size,
        config.pool_checkout_timeout(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
    Ok(Arc::new(store))
}

async fn run_worker_command(config: RuntimeConfig, dump_metrics: bool) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed");
    }

    let store = connect_store(&config).await?;
    let ctx = RuntimeContext::new(config, store)
        .with_registry(builtin_registry())
        .with_server_middleware(ServerChain::new().with(JobLogger).with(ServerMetrics::new()))
        .with_client_middleware(ClientChain::new().with(ClientMetrics::new()));

    let store = Arc::clone(&ctx.store);
    let (delivery, mut remote) = ChannelDelivery::new();
    let launcher = Launcher::connect(ctx, Arc::new(delivery)).await?;
    let mut os_signals = OsSignals::install().context("Failed to install signal handlers")?;

    launcher.run().await?;
    info!(identity = %launcher.identity(), "Worker running; send TERM or INT to stop");

    loop {
        let signal = tokio::select! {
            Some(signal) = remote.recv() => signal,
            signal = os_signals.recv() => signal,
        };
        info!(signal = %signal, "Received signal");
        launcher.handle_signal(signal).await;
        if signal == Signal::Stop {
            break;
        }
    }

    if dump_metrics {
        refresh_queue_depths(&store).await;
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn refresh_queue_depths(store: &Arc<dyn Store>) {
    let metrics = MetricsCollector::new();
    match Stats::fetch(store, SystemClock.now()).await {
        Ok(stats) => {
            for (queue, depth) in &stats.queues {
                metrics.update_queue_depth(queue, *depth);
            }
        }
        Err(e) => warn!(error = %e, "Failed to read queue depths"),
    }
}

async fn run_enqueue_command(config: &RuntimeConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let job = args.descriptor(SystemClock.now())?;
    let store = connect_store(config).await?;
    let client = Client::new(store).with_registry(Arc::new(builtin_registry()));

    match client.push(job).await? {
        Some(jid) => println!("{jid}"),
        None => warn!("Job was suppressed by client middleware"),
    }
    Ok(())
}

async fn run_stats_command(config: &RuntimeConfig, args: StatsArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let now = SystemClock.now();
    let stats = Stats::fetch(&store, now).await?;
    let history = match args.history {
        Some(days) => Some(Stats::history(&store, days, now).await?),
        None => None,
    };

    if args.json {
        let output = serde_json::json!({ "stats": stats, "history": history });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Stats ===");
    println!("Processed:      {}", stats.processed);
    println!("Failed:         {}", stats.failed);
    println!("Enqueued:       {}", stats.enqueued);
    println!("Scheduled:      {}", stats.scheduled_size);
    println!("Retries:        {}", stats.retry_size);
    println!("Dead:           {}", stats.dead_size);
    println!("Processes:      {}", stats.processes_size);
    println!("Busy:           {}", stats.workers_size);
    println!("Latency:        {:.2}s", stats.default_queue_latency);

    if !stats.queues.is_empty() {
        println!("\n=== Queues ===");
        for (name, size) in &stats.queues {
            println!("{name:<24} {size}");
        }
    }

    if let Some(history) = history {
        println!("\n=== History ===");
        for day in history {
            println!("{}  processed={} failed={}", day.date, day.processed, day.failed);
        }
    }
    Ok(())
}

async fn run_processes_command(config: &RuntimeConfig, args: ProcessesArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let processes = ProcessSet::new(Arc::clone(&store));
    let pruned = processes.cleanup().await?;
    if pruned > 0 {
        info!(pruned, "Pruned expired processes");
    }

    let now = SystemClock.now();
    let list = processes.list().await?;
    if list.is_empty() {
        println!("No live processes");
    }
    for process in &list {
        let state = if process.is_stopping() { "quiet" } else { "running" };
        println!(
            "{}  [{}] busy={}/{} queues={} rss={}KB last_beat={:.0}s ago",
            process.identity(),
            state,
            process.busy,
            process.info.concurrency,
            process.info.queues.join(","),
            process.rss_kb,
            (now - process.beat).max(0.0),
        );
    }

    if args.work {
        println!("\n=== Work ===");
        for record in WorkSet::new(store).list().await? {
            let (class, jid) = record
                .job()
                .map(|job| (job.class, job.jid))
                .unwrap_or_else(|| ("?".to_string(), "?".to_string()));
            println!(
                "{} {}  {} {} queue={} running={:.0}s",
                record.identity,
                record.worker_id,
                class,
                jid,
                record.work.queue,
                (now - record.work.run_at).max(0.0),
            );
        }
    }
    Ok(())
}

async fn run_signal_command(config: &RuntimeConfig, args: SignalArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let Some(process) = ProcessSet::new(store).get(&args.identity).await? else {
        bail!("No live process with identity '{}'", args.identity);
    };
    process.signal(args.signal).await?;
    info!(identity = %args.identity, signal = %args.signal, "Signal queued");
    Ok(())
}

async fn run_retry_all_command(config: &RuntimeConfig, args: RetryAllArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let set = match args.set {
        SetName::Retry => JobSet::retries(Arc::clone(&store)),
        SetName::Dead => JobSet::dead(Arc::clone(&store)),
        SetName::Scheduled => JobSet::scheduled(Arc::clone(&store)),
    };
    let client = Client::new(store).with_registry(Arc::new(builtin_registry()));
    let moved = set.retry_all(&client).await?;
    println!("Moved {moved} job(s) from {}", set.name());
    Ok(())
}

#[cfg(target_os = "linux")]
const SIGTSTP: i32 = 20;
#[cfg(all(unix, not(target_os = "linux")))]
const SIGTSTP: i32 = 18;
#[cfg(unix)]
const SIGTTIN: i32 = 21;

/// OS signal streams mapped onto launcher signals.
#[cfg(unix)]
struct OsSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    tstp: tokio::signal::unix::Signal,
    usr1: tokio::signal::unix::Signal,
    ttin: tokio::signal::unix::Signal,
    usr2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            tstp: signal(SignalKind::from_raw(SIGTSTP))?,
            usr1: signal(SignalKind::user_defined1())?,
            ttin: signal(SignalKind::from_raw(SIGTTIN))?,
            usr2: signal(SignalKind::user_defined2())?,
        })
    }

    async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Stop,
            _ = self.terminate.recv() => Signal::Stop,
            _ = self.tstp.recv() => Signal::Quiet,
            _ = self.usr1.recv() => Signal::Quiet,
            _ = self.ttin.recv() => Signal::DumpWork,
            _ = self.usr2.recv() => Signal::DumpWork,
        }
    }
}

#[cfg(not(unix))]
struct OsSignals;

#[cfg(not(unix))]
impl OsSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Signal {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        Signal::Stop
    }
}
