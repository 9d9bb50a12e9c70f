//! Job descriptors, per-class options and the worker registry.

pub mod descriptor;
pub mod options;
pub mod registry;
pub mod worker;

pub use descriptor::{generate_jid, BacktracePolicy, JobDescriptor, RetryPolicy, DEFAULT_QUEUE};
pub use options::JobOptions;
pub use registry::{JobRegistry, RegisteredWorker};
pub use worker::Worker;
