//! Batch configuration.

use serde::{Deserialize, Serialize};

/// Defaults for launched batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Run partitions in parallel rather than one child at a time
    pub parallel: bool,

    /// Concurrency cap of parallel batches
    pub max_parallel: usize,

    /// Stop starting children after the first failure
    pub stop_on_first_failure: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: 4,
            stop_on_first_failure: false,
        }
    }
}

impl BatchConfig {
    /// Run batches in parallel with at most `max` children at once.
    pub fn with_parallel(mut self, max: usize) -> Self {
        self.parallel = true;
        self.max_parallel = max.max(1);
        self
    }

    /// Set the failure policy.
    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }
}
