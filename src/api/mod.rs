//! Read and maintenance operations over the shared store, for operators
//! and tooling. None of these are used by the runtime itself.

pub mod process;
pub mod queue;
pub mod sets;
pub mod stats;

use thiserror::Error;

use crate::client::ClientError;
use crate::job::JobDescriptor;
use crate::store::StoreError;

pub use self::process::{ProcessRecord, ProcessSet, WorkRecord, WorkSet};
pub use self::queue::QueueView;
pub use self::sets::{JobSet, SortedEntry};
pub use self::stats::{DayStats, Stats};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("History must cover 1 to {max} days, got {days}")]
    InvalidDays { days: u32, max: u32 },
}

/// A stored job: the raw payload and, when it parses, the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub value: String,
    pub item: Option<JobDescriptor>,
}

impl JobRecord {
    pub fn parse(value: String) -> Self {
        let item = JobDescriptor::from_json(&value).ok();
        Self { value, item }
    }

    pub fn jid(&self) -> Option<&str> {
        self.item.as_ref().map(|job| job.jid.as_str())
    }

    pub fn class(&self) -> Option<&str> {
        self.item.as_ref().map(|job| job.class.as_str())
    }
}
