//! The launcher: starts every capsule's manager, the scheduled poller and
//! the heartbeat, and drives the quiet → stop shutdown sequence.
//!
//! ```text
//! Idle --run--> Running --quiet--> Quiet --stop--> Stopping --> Stopped
//!                  └──────────────stop──────────────┘
//! ```

pub mod capsule;
pub mod context;
pub mod heartbeat;
pub mod signal;
pub mod work_state;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub use self::capsule::Capsule;
pub use self::context::{default_identity, ProcessCounters, RuntimeContext};
pub use self::heartbeat::{Heartbeat, HeartbeatError, ProcessInfo, RttMonitor};
pub use self::signal::{ChannelDelivery, IgnoreSignals, Signal, SignalDelivery, UnknownSignal};
pub use self::work_state::{WorkEntry, WorkState};

use crate::processor::Manager;
use crate::scheduled::Poller;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("Launcher has already been started")]
    AlreadyStarted,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    Idle,
    Running,
    Quiet,
    Stopping,
    Stopped,
}

impl fmt::Display for LauncherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LauncherState::Idle => "idle",
            LauncherState::Running => "running",
            LauncherState::Quiet => "quiet",
            LauncherState::Stopping => "stopping",
            LauncherState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

pub struct Launcher {
    ctx: RuntimeContext,
    state: StdMutex<LauncherState>,
    managers: Mutex<Vec<Manager>>,
    poller: Arc<Poller>,
    heartbeat: Arc<Heartbeat>,
    quiet_flag: Arc<AtomicBool>,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launcher")
            .field("identity", &self.ctx.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Launcher {
    pub fn new(ctx: RuntimeContext, capsules: Vec<Capsule>, signals: Arc<dyn SignalDelivery>) -> Self {
        let configs: Vec<_> = capsules.iter().map(|c| c.config.clone()).collect();
        let info = ProcessInfo::new(&ctx, &configs);
        let quiet_flag = Arc::new(AtomicBool::new(false));
        let heartbeat = Arc::new(Heartbeat::new(
            ctx.clone(),
            info,
            Arc::clone(&quiet_flag),
            signals,
        ));
        let managers = capsules
            .into_iter()
            .map(|capsule| Manager::new(capsule, ctx.clone()))
            .collect();
        let (heartbeat_stop, _) = watch::channel(false);

        Self {
            poller: Arc::new(Poller::new(ctx.clone())),
            ctx,
            state: StdMutex::new(LauncherState::Idle),
            managers: Mutex::new(managers),
            heartbeat,
            quiet_flag,
            heartbeat_stop,
            heartbeat_task: Mutex::new(None),
        }
    }

    /// Opens one redis pool per configured capsule and builds the launcher.
    pub async fn connect(
        ctx: RuntimeContext,
        signals: Arc<dyn SignalDelivery>,
    ) -> Result<Self, LauncherError> {
        let mut capsules = Vec::with_capacity(ctx.config.capsules.len());
        for config in &ctx.config.capsules {
            capsules.push(Capsule::connect(config.clone(), &ctx.config).await?);
        }
        Ok(Self::new(ctx, capsules, signals))
    }

    pub fn state(&self) -> LauncherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &str {
        &self.ctx.identity
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Starts managers, poller and heartbeat.
    pub async fn run(&self) -> Result<(), LauncherError> {
        if !self.transition(&[LauncherState::Idle], LauncherState::Running) {
            return Err(LauncherError::AlreadyStarted);
        }

        for manager in self.managers.lock().await.iter_mut() {
            manager.start();
        }
        self.poller.start().await;

        let heartbeat = Arc::clone(&self.heartbeat);
        let stop_rx = self.heartbeat_stop.subscribe();
        *self.heartbeat_task.lock().await =
            Some(tokio::spawn(async move { heartbeat.run(stop_rx).await }));

        info!(
            identity = %self.ctx.identity,
            capsules = self.ctx.config.capsules.len(),
            concurrency = self.heartbeat.info().concurrency,
            "Launcher running"
        );
        Ok(())
    }

    /// Stops fetching new work and scheduled polling. Only the first call
    /// from Running has an effect; returns whether this call changed state.
    pub async fn quiet(&self) -> bool {
        if !self.transition(&[LauncherState::Running], LauncherState::Quiet) {
            return false;
        }

        self.quiet_flag.store(true, Ordering::SeqCst);
        for manager in self.managers.lock().await.iter() {
            manager.quiet();
        }
        self.poller.signal_stop();

        info!(identity = %self.ctx.identity, "Launcher quiet");
        true
    }

    /// Shuts down within the configured timeout; returns the number of
    /// processors abandoned at the deadline.
    pub async fn stop(&self) -> usize {
        let deadline = Instant::now() + self.ctx.config.timeout();

        if self.transition(&[LauncherState::Idle], LauncherState::Stopped) {
            return 0;
        }
        self.quiet().await;
        if !self.transition(&[LauncherState::Quiet], LauncherState::Stopping) {
            return 0;
        }
        info!(
            identity = %self.ctx.identity,
            timeout_secs = self.ctx.config.timeout_secs,
            "Launcher stopping"
        );

        let managers = std::mem::take(&mut *self.managers.lock().await);
        let waiters = managers.into_iter().map(|mut manager| {
            tokio::spawn(async move { manager.stop(deadline).await })
        });
        let mut abandoned = 0;
        for result in join_all(waiters).await {
            match result {
                Ok(count) => abandoned += count,
                Err(e) => error!(error = %e, "Manager stop task failed"),
            }
        }

        self.poller.terminate().await;

        self.heartbeat_stop.send_replace(true);
        let task = self.heartbeat_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Heartbeat task failed");
            }
        }
        if let Err(e) = self.heartbeat.clear().await {
            warn!(identity = %self.ctx.identity, error = %e, "Failed to clear heartbeat");
        }

        self.transition(&[LauncherState::Stopping], LauncherState::Stopped);
        info!(identity = %self.ctx.identity, abandoned, "Launcher stopped");
        abandoned
    }

    /// Applies an OS or remote signal.
    pub async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Quiet => {
                self.quiet().await;
            }
            Signal::Stop => {
                self.stop().await;
            }
            Signal::DumpWork => self.dump_work(),
        }
    }

    /// Logs every in-flight job.
    pub fn dump_work(&self) {
        let snapshot = self.ctx.work_state.snapshot();
        info!(identity = %self.ctx.identity, busy = snapshot.len(), "Work dump");
        for (worker_id, entry) in snapshot {
            info!(
                worker_id = %worker_id,
                queue = %entry.queue,
                run_at = entry.run_at,
                payload = %entry.payload,
                "In-flight job"
            );
        }
    }

    fn transition(&self, from: &[LauncherState], to: LauncherState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }
}
