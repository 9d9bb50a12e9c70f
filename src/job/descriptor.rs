//! The job descriptor: the serialized unit of work.
//!
//! A descriptor is a flat JSON object stored verbatim as a queue entry or a
//! sorted-set member:
//!
//! ```text
//! {"class":"InvoiceMailer","args":[42,"eur"],"queue":"mailers",
//!  "jid":"2f0c9e1b7a4d8c6e5f3a1b0c","created_at":1709294400.12,
//!  "enqueued_at":1709294400.13,"retry":true}
//! ```
//!
//! Absent optional fields deserialize to their defaults (`queue` = "default",
//! `retry` = true, `backtrace` = false). Fields this crate does not know are
//! kept in [`JobDescriptor::extra`] so middleware-added keys survive a
//! round-trip through the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Queue used when a descriptor does not name one.
pub const DEFAULT_QUEUE: &str = "default";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// Whether (and how often) a failed job is retried.
///
/// Serialized as the bare JSON value: `true`, `false` or an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    /// `true` retries up to the runtime's configured maximum, `false` never retries.
    Enabled(bool),
    /// Retry at most this many times.
    Limit(u32),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Enabled(true)
    }
}

impl RetryPolicy {
    /// Maximum retry attempts, or `None` when the job must not be retried.
    pub fn max_attempts(&self, default_max: u32) -> Option<u32> {
        match *self {
            RetryPolicy::Enabled(true) => Some(default_max),
            RetryPolicy::Enabled(false) => None,
            RetryPolicy::Limit(limit) => Some(limit),
        }
    }
}

/// Whether the error backtrace is stored with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktracePolicy {
    /// `true` keeps every line, `false` keeps none.
    Enabled(bool),
    /// Keep at most this many lines.
    Lines(usize),
}

impl Default for BacktracePolicy {
    fn default() -> Self {
        BacktracePolicy::Enabled(false)
    }
}

impl BacktracePolicy {
    /// Maximum number of backtrace lines to keep, `None` when disabled.
    pub fn line_limit(&self) -> Option<usize> {
        match *self {
            BacktracePolicy::Enabled(true) => Some(usize::MAX),
            BacktracePolicy::Enabled(false) => None,
            BacktracePolicy::Lines(0) => None,
            BacktracePolicy::Lines(lines) => Some(lines),
        }
    }
}

fn is_default_backtrace(policy: &BacktracePolicy) -> bool {
    *policy == BacktracePolicy::default()
}

/// A job as stored in queues and sorted sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Registered class identifier of the worker that runs this job.
    pub class: String,
    /// Positional arguments passed to the worker.
    pub args: Vec<Value>,
    /// Queue the job is pushed to.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Unique job id, assigned by the client when empty.
    #[serde(default)]
    pub jid: String,
    /// When the client created the job (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    /// When the job was last pushed onto a live queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    /// Requested execution time for scheduled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "is_default_backtrace")]
    pub backtrace: BacktracePolicy,
    /// Queue used for retries instead of `queue`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_queue: Option<String>,
    /// `Some(false)` keeps an exhausted job out of the dead set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    /// Request correlation id propagated from the enqueuing context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    // Failure bookkeeping, written only by the retry handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Compressed backtrace (JSON lines, zlib, base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<String>,

    /// Fields not modelled above, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobDescriptor {
    /// Builds a descriptor for `class` with the given arguments.
    ///
    /// `args` may be anything that serializes to a JSON array (a `Vec`, a
    /// tuple, a `serde_json::Value::Array`, ...).
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when `class` is empty, when `args` cannot be
    /// serialized, or when it does not serialize to an array.
    pub fn new<A: Serialize>(class: impl Into<String>, args: A) -> Result<Self, ValidationError> {
        let class = class.into();
        if class.trim().is_empty() {
            return Err(ValidationError::MissingClass);
        }

        let args = match serde_json::to_value(args)
            .map_err(|e| ValidationError::UnserializableArgs(e.to_string()))?
        {
            Value::Array(items) => items,
            other => return Err(ValidationError::ArgsNotArray(json_type_name(&other))),
        };

        Ok(Self {
            class,
            args,
            queue: default_queue(),
            jid: String::new(),
            created_at: None,
            enqueued_at: None,
            at: None,
            retry: RetryPolicy::default(),
            backtrace: BacktracePolicy::default(),
            retry_queue: None,
            dead: None,
            correlation_id: None,
            tags: Vec::new(),
            retry_count: None,
            failed_at: None,
            retried_at: None,
            error_message: None,
            error_class: None,
            error_backtrace: None,
            extra: Map::new(),
        })
    }

    /// Sets the queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the backtrace policy.
    pub fn with_backtrace(mut self, backtrace: BacktracePolicy) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Schedules the job for `at` unix seconds.
    pub fn with_at(mut self, at: f64) -> Self {
        self.at = Some(at);
        self
    }

    /// Sets an explicit job id.
    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = jid.into();
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Checks the invariants a descriptor must hold before it is pushed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.class.trim().is_empty() {
            return Err(ValidationError::MissingClass);
        }
        validate_queue_name(&self.queue)?;
        if let Some(retry_queue) = &self.retry_queue {
            validate_queue_name(retry_queue)?;
        }
        if let Some(at) = self.at {
            if !at.is_finite() {
                return Err(ValidationError::InvalidSchedule(at));
            }
        }
        Ok(())
    }

    /// Serializes the descriptor to its stored JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a stored descriptor.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Whether the job has failed at least once.
    pub fn has_error(&self) -> bool {
        self.error_class.is_some()
    }

    /// Seconds the job has been waiting since it was enqueued (or created).
    pub fn latency(&self, now: f64) -> f64 {
        let since = self.enqueued_at.or(self.created_at).unwrap_or(now);
        (now - since).max(0.0)
    }
}

/// Generates a new job id: 24 lowercase hex characters.
pub fn generate_jid() -> String {
    let id = Uuid::new_v4();
    hex::encode(&id.as_bytes()[..12])
}

fn validate_queue_name(queue: &str) -> Result<(), ValidationError> {
    if queue.is_empty() {
        return Err(ValidationError::MissingQueue);
    }
    if queue.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidQueueName(queue.to_string()));
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
