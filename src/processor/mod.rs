//! Job execution: fetching, the processor loop, retries and the per-capsule
//! manager.

pub mod fetch;
pub mod manager;
pub mod retry;
pub mod worker;

pub use self::fetch::{BasicFetch, UnitOfWork};
pub use self::manager::Manager;
pub use self::retry::{
    compress_backtrace, decompress_backtrace, default_backoff, DeadSetLimits, DeathHandler,
    RetryError, RetryHandler, RetryOutcome,
};
pub use self::worker::{Processed, Processor, WorkSlot};
