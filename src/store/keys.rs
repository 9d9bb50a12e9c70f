//! Key layout in the shared store.
//!
//! | key | type | contents |
//! |---|---|---|
//! | `queues` | set | names of every queue ever pushed to |
//! | `queue:<name>` | list | serialized descriptors, LPUSH in / BRPOP out |
//! | `schedule`, `retry`, `dead` | sorted set | descriptors scored by unix seconds |
//! | `processes` | set | identities of live processes |
//! | `<identity>` | hash | heartbeat record |
//! | `<identity>:work` | hash | worker id → in-flight work |
//! | `<identity>-signals` | list | pending remote signals |
//! | `stat:processed[:<day>]`, `stat:failed[:<day>]` | string | counters |

pub const QUEUES: &str = "queues";
pub const SCHEDULE: &str = "schedule";
pub const RETRY: &str = "retry";
pub const DEAD: &str = "dead";
pub const PROCESSES: &str = "processes";
pub const STAT_PROCESSED: &str = "stat:processed";
pub const STAT_FAILED: &str = "stat:failed";
pub const PROCESS_CLEANUP_LOCK: &str = "process_cleanup";

const QUEUE_PREFIX: &str = "queue:";

/// List key for a queue name.
pub fn queue(name: &str) -> String {
    format!("{QUEUE_PREFIX}{name}")
}

/// Queue name for a list key, if it is one.
pub fn queue_name(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_PREFIX)
}

pub fn work(identity: &str) -> String {
    format!("{identity}:work")
}

pub fn signals(identity: &str) -> String {
    format!("{identity}-signals")
}

pub fn daily_processed(day: &str) -> String {
    format!("{STAT_PROCESSED}:{day}")
}

pub fn daily_failed(day: &str) -> String {
    format!("{STAT_FAILED}:{day}")
}
