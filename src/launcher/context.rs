//! Process-wide state shared by managers, processors, heartbeat and poller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::work_state::WorkState;
use crate::client::Client;
use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::job::JobRegistry;
use crate::middleware::{ClientChain, ServerChain};
use crate::processor::{DeadSetLimits, DeathHandler, RetryHandler};
use crate::store::Store;

/// Processed/failed counts not yet flushed to the store.
#[derive(Debug, Default)]
pub struct ProcessCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ProcessCounters {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `(processed, failed)` and resets both to zero.
    pub fn take(&self) -> (u64, u64) {
        (
            self.processed.swap(0, Ordering::SeqCst),
            self.failed.swap(0, Ordering::SeqCst),
        )
    }

    /// Adds back counts whose flush failed.
    pub fn restore(&self, processed: u64, failed: u64) {
        self.processed.fetch_add(processed, Ordering::SeqCst);
        self.failed.fetch_add(failed, Ordering::SeqCst);
    }

    /// Current `(processed, failed)` without resetting.
    pub fn peek(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
        )
    }
}

/// Everything a running process shares between its components.
///
/// Cheap to clone; all mutable parts are behind `Arc`.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<RuntimeConfig>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<JobRegistry>,
    pub server_middleware: Arc<ServerChain>,
    pub client_middleware: Arc<ClientChain>,
    pub death_handlers: Arc<Vec<Arc<dyn DeathHandler>>>,
    pub work_state: WorkState,
    pub counters: Arc<ProcessCounters>,
    pub clock: Arc<dyn Clock>,
    pub identity: String,
    pub started_at: f64,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("identity", &self.identity)
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("server_middleware", &self.server_middleware)
            .field("client_middleware", &self.client_middleware)
            .field("death_handlers", &self.death_handlers.len())
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Creates a context with an empty registry and middleware chains.
    pub fn new(config: RuntimeConfig, store: Arc<dyn Store>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let started_at = clock.now();

        Self {
            config: Arc::new(config),
            store,
            registry: Arc::new(JobRegistry::new()),
            server_middleware: Arc::new(ServerChain::new()),
            client_middleware: Arc::new(ClientChain::new()),
            death_handlers: Arc::new(Vec::new()),
            work_state: WorkState::new(),
            counters: Arc::new(ProcessCounters::default()),
            clock,
            identity: default_identity(),
            started_at,
        }
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_server_middleware(mut self, chain: ServerChain) -> Self {
        self.server_middleware = Arc::new(chain);
        self
    }

    pub fn with_client_middleware(mut self, chain: ClientChain) -> Self {
        self.client_middleware = Arc::new(chain);
        self
    }

    pub fn with_death_handler(mut self, handler: Arc<dyn DeathHandler>) -> Self {
        let mut handlers: Vec<Arc<dyn DeathHandler>> = self.death_handlers.iter().cloned().collect();
        handlers.push(handler);
        self.death_handlers = Arc::new(handlers);
        self
    }

    /// Replaces the clock; `started_at` is re-read from it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started_at = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// A client sharing this context's store, middleware, registry and clock.
    pub fn client(&self) -> Client {
        Client::new(Arc::clone(&self.store))
            .with_middleware(Arc::clone(&self.client_middleware))
            .with_registry(Arc::clone(&self.registry))
            .with_clock(Arc::clone(&self.clock))
    }

    /// A retry handler writing to `store`.
    pub fn retry_handler(&self, store: Arc<dyn Store>) -> RetryHandler {
        RetryHandler::new(
            store,
            Arc::clone(&self.clock),
            self.config.max_retries,
            DeadSetLimits {
                max_jobs: self.config.dead_max_jobs,
                timeout: self.config.dead_timeout(),
            },
            Arc::clone(&self.death_handlers),
        )
    }
}

/// `<hostname>:<pid>:<nonce>`, unique per process start.
pub fn default_identity() -> String {
    let nonce = Uuid::new_v4();
    format!(
        "{}:{}:{}",
        hostname(),
        std::process::id(),
        hex::encode(&nonce.as_bytes()[..6])
    )
}

/// Best-effort host name: `$HOSTNAME`, then `/etc/hostname`.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
