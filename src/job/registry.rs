//! Registry mapping class names to workers and their options.

use std::collections::HashMap;
use std::sync::Arc;

use super::options::JobOptions;
use super::worker::Worker;

/// A worker together with the options it was registered with.
#[derive(Clone)]
pub struct RegisteredWorker {
    pub worker: Arc<dyn Worker>,
    pub options: JobOptions,
}

impl std::fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Class name → worker lookup.
///
/// Built before the runtime starts and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    workers: HashMap<String, RegisteredWorker>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `worker` under `class`, replacing any earlier registration.
    pub fn register(
        &mut self,
        class: impl Into<String>,
        options: JobOptions,
        worker: impl Worker + 'static,
    ) -> &mut Self {
        self.workers.insert(
            class.into(),
            RegisteredWorker {
                worker: Arc::new(worker),
                options,
            },
        );
        self
    }

    /// Builder-style variant of [`JobRegistry::register`].
    pub fn with(
        mut self,
        class: impl Into<String>,
        options: JobOptions,
        worker: impl Worker + 'static,
    ) -> Self {
        self.register(class, options, worker);
        self
    }

    pub fn get(&self, class: &str) -> Option<&RegisteredWorker> {
        self.workers.get(class)
    }

    /// Options for `class`, or the defaults when it is not registered.
    pub fn options_for(&self, class: &str) -> JobOptions {
        self.workers
            .get(class)
            .map(|registered| registered.options.clone())
            .unwrap_or_default()
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
