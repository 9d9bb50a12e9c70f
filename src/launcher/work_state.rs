//! In-flight work shared between processors and the heartbeat.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// One job currently being executed, as published in `<identity>:work`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEntry {
    pub queue: String,
    /// Raw descriptor JSON as fetched.
    pub payload: String,
    pub run_at: f64,
}

/// Worker id → in-flight job.
///
/// Each processor only touches its own entry. Readers get a snapshot that
/// may already be stale.
#[derive(Debug, Clone, Default)]
pub struct WorkState {
    entries: Arc<RwLock<HashMap<String, WorkEntry>>>,
}

impl WorkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker_id: &str, entry: WorkEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id.to_string(), entry);
    }

    pub fn remove(&self, worker_id: &str) -> Option<WorkEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id)
    }

    pub fn snapshot(&self) -> HashMap<String, WorkEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: &str) -> WorkEntry {
        WorkEntry {
            queue: "default".to_string(),
            payload: payload.to_string(),
            run_at: 1.0,
        }
    }

    #[test]
    fn test_register_and_remove() {
        let state = WorkState::new();
        assert!(state.is_empty());

        state.register("w-1", entry("a"));
        state.register("w-2", entry("b"));
        state.register("w-1", entry("c"));
        assert_eq!(state.len(), 2);
        assert_eq!(state.snapshot()["w-1"].payload, "c");

        assert_eq!(state.remove("w-2"), Some(entry("b")));
        assert_eq!(state.remove("w-2"), None);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let state = WorkState::new();
        let other = state.clone();
        other.register("w-1", entry("a"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_entry_json_shape() {
        let json = serde_json::to_value(entry("{}")).expect("serializes");
        assert_eq!(json["queue"], "default");
        assert_eq!(json["payload"], "{}");
        assert_eq!(json["run_at"], 1.0);
    }
}
