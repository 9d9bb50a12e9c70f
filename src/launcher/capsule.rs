//! A capsule paired with the store its processors fetch from.

use std::sync::Arc;

use crate::config::{CapsuleConfig, RuntimeConfig};
use crate::store::{RedisStore, Store, StoreError};

/// Capsule configuration plus its dedicated store handle.
///
/// Blocking fetches hold a connection for their whole timeout, so each
/// capsule gets a pool sized to its concurrency.
#[derive(Debug, Clone)]
pub struct Capsule {
    pub config: CapsuleConfig,
    pub store: Arc<dyn Store>,
}

impl Capsule {
    pub fn new(config: CapsuleConfig, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    /// Opens a redis pool with one connection per processor.
    pub async fn connect(config: CapsuleConfig, runtime: &RuntimeConfig) -> Result<Self, StoreError> {
        let store = RedisStore::connect(
            &runtime.redis_url,
            config.concurrency,
            runtime.pool_checkout_timeout(),
        )
        .await?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}
