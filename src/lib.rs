//! jobforge: a redis-backed background job runtime.
//!
//! Jobs are JSON descriptors pushed onto named queues by a [`Client`].
//! A worker process ([`Launcher`]) runs one or more capsules, each a pool of
//! processors fetching from its own queue list. Failed jobs move to the
//! retry set with exponential backoff; the scheduled poller promotes due
//! retries and scheduled jobs back onto their queues. Every process
//! heartbeats into the store so operators can inspect and signal it through
//! the [`api`] module.

pub mod api;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod metrics;
pub mod middleware;
pub mod processor;
pub mod scheduled;
pub mod store;

pub use client::{Client, ClientError};
pub use config::{CapsuleConfig, ConfigError, QueueWeight, RuntimeConfig};
pub use error::{JobError, ValidationError};
pub use job::{JobDescriptor, JobOptions, JobRegistry, RetryPolicy, Worker};
pub use launcher::{Launcher, LauncherError, LauncherState, RuntimeContext, Signal};
pub use store::{MemoryStore, RedisStore, Store, StoreError};
