//! Reconciler configuration.

use crate::policy::{AllowAll, AllowList, OperationCodePolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Reconciler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Age after which an untagged foreign task is watched anyway
    pub grace_window_ms: u64,

    /// Estimated remote clock minus local clock
    pub clock_offset_ms: i64,

    /// Poll interval of meddling operations
    pub poll_interval_ms: u64,

    /// Whether matched tasks are also polled, not only fed by notifications
    pub poll_matched: bool,

    /// Interval of the unmatched sweep
    pub sweep_interval_ms: u64,

    /// How long a finished task is remembered so redelivery is ignored
    pub finished_retention_ms: u64,

    /// Recognized operation codes; `None` recognizes every code
    pub recognized_codes: Option<Vec<String>>,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: 5000,
            clock_offset_ms: 0,
            poll_interval_ms: 900,
            poll_matched: true,
            sweep_interval_ms: 1000,
            finished_retention_ms: 600_000,
            recognized_codes: None,
            event_capacity: 256,
        }
    }
}

impl ReconcilerConfig {
    /// Set the grace window.
    pub fn with_grace_window_ms(mut self, ms: u64) -> Self {
        self.grace_window_ms = ms;
        self
    }

    /// Set the estimated clock offset.
    pub fn with_clock_offset_ms(mut self, ms: i64) -> Self {
        self.clock_offset_ms = ms;
        self
    }

    /// Enable or disable polling of matched tasks.
    pub fn with_polling(mut self, poll: bool) -> Self {
        self.poll_matched = poll;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set how long finished tasks are remembered.
    pub fn with_finished_retention_ms(mut self, ms: u64) -> Self {
        self.finished_retention_ms = ms;
        self
    }

    /// Restrict watched tasks to the given operation codes.
    pub fn with_recognized_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recognized_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    /// Grace window as a chrono duration.
    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.grace_window_ms).unwrap_or(i64::MAX))
    }

    /// Clock offset as a chrono duration.
    pub fn clock_offset(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.clock_offset_ms)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Retention of the finished set as a chrono duration.
    pub fn finished_retention(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.finished_retention_ms).unwrap_or(i64::MAX))
    }

    /// Operation-code policy described by this configuration.
    pub fn policy(&self) -> Arc<dyn OperationCodePolicy> {
        match &self.recognized_codes {
            Some(codes) => Arc::new(AllowList::new(codes.iter().cloned())),
            None => Arc::new(AllowAll),
        }
    }
}
