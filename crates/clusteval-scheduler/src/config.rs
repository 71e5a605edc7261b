use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Extra attempts for transient execution failures.
    pub max_retries: u32,
    /// How long dropping the scheduler waits for running runnables.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}
