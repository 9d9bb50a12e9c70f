//! Runtime configuration.
//!
//! Configuration is layered: defaults, then an optional YAML file, then
//! `JOBFORGE_*` environment variables, then command-line flags. Call
//! [`RuntimeConfig::validate`] once all layers are applied.
//!
//! ```yaml
//! redis_url: redis://127.0.0.1:6379
//! timeout_secs: 25
//! tag: billing
//! capsules:
//!   - name: default
//!     concurrency: 10
//!     queues: ["critical,3", "default,1"]
//!   - name: single
//!     concurrency: 1
//!     queues: ["serial"]
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A queue name with its selection weight, written `name` or `name,weight`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueWeight {
    pub name: String,
    pub weight: u32,
}

impl QueueWeight {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

impl FromStr for QueueWeight {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "queues".to_string(),
            message,
        };

        let (name, weight) = match s.split_once(',') {
            Some((name, weight)) => {
                let weight = weight
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid weight in '{s}'")))?;
                (name.trim(), weight)
            }
            None => (s.trim(), 0),
        };

        if name.is_empty() {
            return Err(invalid(format!("missing queue name in '{s}'")));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid(format!("queue name '{name}' contains whitespace")));
        }

        Ok(Self::new(name, weight))
    }
}

impl TryFrom<String> for QueueWeight {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QueueWeight> for String {
    fn from(queue: QueueWeight) -> Self {
        queue.to_string()
    }
}

impl fmt::Display for QueueWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weight == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{},{}", self.name, self.weight)
        }
    }
}

/// How a capsule orders its queues for each fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Fixed priority order, as configured.
    Strict,
    /// Uniformly shuffled every fetch.
    Random,
    /// Shuffled with probability proportional to weight.
    Weighted,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Strict => write!(f, "strict"),
            QueueMode::Random => write!(f, "random"),
            QueueMode::Weighted => write!(f, "weighted"),
        }
    }
}

/// One capsule: a named set of queues served by a fixed number of processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueWeight>,
}

fn default_concurrency() -> usize {
    5
}

fn default_queues() -> Vec<QueueWeight> {
    vec![QueueWeight::new(crate::job::DEFAULT_QUEUE, 0)]
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: default_concurrency(),
            queues: default_queues(),
        }
    }
}

impl CapsuleConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            queues: default_queues(),
        }
    }

    /// Replaces the queue list.
    pub fn with_queues(mut self, queues: Vec<QueueWeight>) -> Self {
        self.queues = queues;
        self
    }

    /// Appends a queue.
    pub fn with_queue(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.queues.push(QueueWeight::new(name, weight));
        self
    }

    /// All weights 0 → strict; all weights at most 1 → random; else weighted.
    pub fn mode(&self) -> QueueMode {
        if self.queues.iter().all(|q| q.weight == 0) {
            QueueMode::Strict
        } else if self.queues.iter().all(|q| q.weight <= 1) {
            QueueMode::Random
        } else {
            QueueMode::Weighted
        }
    }

    /// Queue names, each repeated `weight` times (at least once).
    pub fn expanded_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .flat_map(|q| std::iter::repeat(q.name.clone()).take(q.weight.max(1) as usize))
            .collect()
    }

    /// Distinct queue names in configured order.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            if !names.contains(&queue.name) {
                names.push(queue.name.clone());
            }
        }
        names
    }
}

/// Configuration for a runtime process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Connections shared by the client, poller and heartbeat.
    pub pool_size: usize,
    /// How long to wait for a pooled connection.
    pub pool_checkout_timeout_ms: u64,
    /// Shutdown deadline for in-flight jobs.
    pub timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Blocking fetch timeout.
    pub fetch_timeout_ms: u64,
    /// Per-process average poll interval, multiplied by the process count.
    pub average_scheduled_poll_interval_secs: f64,
    /// Fixed average poll interval, ignoring the process count.
    pub poll_interval_average_secs: Option<f64>,
    pub poll_initial_wait_secs: f64,
    /// Retry limit for jobs with `retry: true`.
    pub max_retries: u32,
    pub dead_max_jobs: usize,
    pub dead_timeout_secs: u64,
    /// Free-form process tag shown in process listings.
    pub tag: Option<String>,
    pub labels: Vec<String>,
    pub capsules: Vec<CapsuleConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 5,
            pool_checkout_timeout_ms: 1_000,
            timeout_secs: 25,
            heartbeat_interval_secs: 10,
            fetch_timeout_ms: 2_000,
            average_scheduled_poll_interval_secs: 15.0,
            poll_interval_average_secs: None,
            poll_initial_wait_secs: 5.0,
            max_retries: 25,
            dead_max_jobs: 10_000,
            dead_timeout_secs: 180 * 24 * 60 * 60,
            tag: None,
            labels: Vec::new(),
            capsules: vec![CapsuleConfig::default()],
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML file; missing fields keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Applies overrides from the process environment.
    ///
    /// Recognized variables:
    /// - `JOBFORGE_REDIS_URL` (or `REDIS_URL`)
    /// - `JOBFORGE_CONCURRENCY`: concurrency of the first capsule
    /// - `JOBFORGE_TIMEOUT_SECS`
    /// - `JOBFORGE_TAG`
    /// - `JOBFORGE_QUEUES`: whitespace-separated `name[,weight]` list for the first capsule
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("JOBFORGE_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            self.redis_url = url;
        }

        if let Some(val) = lookup("JOBFORGE_TIMEOUT_SECS") {
            self.timeout_secs = parse_env_value(&val, "JOBFORGE_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("JOBFORGE_TAG") {
            self.tag = Some(val);
        }

        if let Some(val) = lookup("JOBFORGE_CONCURRENCY") {
            let concurrency = parse_env_value(&val, "JOBFORGE_CONCURRENCY")?;
            self.first_capsule().concurrency = concurrency;
        }

        if let Some(val) = lookup("JOBFORGE_QUEUES") {
            let queues = val
                .split_whitespace()
                .map(QueueWeight::from_str)
                .collect::<Result<Vec<_>, _>>()?;
            self.first_capsule().queues = queues;
        }

        Ok(())
    }

    fn first_capsule(&mut self) -> &mut CapsuleConfig {
        if self.capsules.is_empty() {
            self.capsules.push(CapsuleConfig::default());
        }
        &mut self.capsules[0]
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_scheme = ["redis://", "rediss://", "unix://", "redis+unix://"]
            .iter()
            .any(|scheme| self.redis_url.starts_with(scheme));
        if !valid_scheme {
            return Err(ConfigError::ValidationFailed(format!(
                "redis_url must be a redis:// URL, got '{}'",
                self.redis_url
            )));
        }

        if self.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let poll_average = self
            .poll_interval_average_secs
            .unwrap_or(self.average_scheduled_poll_interval_secs);
        if !(poll_average.is_finite() && poll_average > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "scheduled poll interval must be a positive number of seconds".to_string(),
            ));
        }

        if !(self.poll_initial_wait_secs.is_finite() && self.poll_initial_wait_secs >= 0.0) {
            return Err(ConfigError::ValidationFailed(
                "poll_initial_wait_secs must be a non-negative number of seconds".to_string(),
            ));
        }

        if self.capsules.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one capsule must be configured".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.capsules.len());
        for capsule in &self.capsules {
            if capsule.name.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "capsule name must not be empty".to_string(),
                ));
            }
            if seen.contains(&capsule.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate capsule name '{}'",
                    capsule.name
                )));
            }
            seen.push(capsule.name.as_str());

            if capsule.concurrency == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "capsule '{}' concurrency must be greater than 0",
                    capsule.name
                )));
            }
            if capsule.queues.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "capsule '{}' must have at least one queue",
                    capsule.name
                )));
            }
        }

        Ok(())
    }

    /// Total processors across all capsules.
    pub fn total_concurrency(&self) -> usize {
        self.capsules.iter().map(|c| c.concurrency).sum()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn pool_checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_checkout_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_timeout_secs)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    /// Fixes the poller's average interval regardless of process count.
    pub fn with_poll_interval_average(mut self, secs: f64) -> Self {
        self.poll_interval_average_secs = Some(secs);
        self
    }

    pub fn with_poll_initial_wait(mut self, secs: f64) -> Self {
        self.poll_initial_wait_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dead_max_jobs(mut self, max_jobs: usize) -> Self {
        self.dead_max_jobs = max_jobs;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Replaces all capsules.
    pub fn with_capsules(mut self, capsules: Vec<CapsuleConfig>) -> Self {
        self.capsules = capsules;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
