//! Remote task model - records owned by the control plane.

use crate::id::{CorrelationId, TaskRef};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Keys this console reads and writes in a task's other-config map.
pub mod metadata_keys {
    /// Application id of the console process that created the task.
    pub const OWNER_ID: &str = "owner_id";
    /// Stable installation id of the console that created the task.
    pub const OWNER_INSTALLATION: &str = "owner_installation";
    /// Correlation id of the local operation tracking the task.
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Objects the task applies to, published by aware clients.
    pub const APPLIES_TO: &str = "applies_to";
    /// Domain operation code.
    pub const OPERATION: &str = "operation";

    /// Keys removed when the console gives up ownership of a task.
    pub const OWNERSHIP: [&str; 3] = [OWNER_ID, OWNER_INSTALLATION, CORRELATION_ID];
}

/// Status reported by the control plane for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    /// Still running
    Pending,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failure,
    /// Cancelled
    Cancelled,
}

impl RemoteTaskStatus {
    /// Whether the remote task has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RemoteTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of a task record as delivered by the session or change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    /// Reference of the task on its endpoint
    pub reference: TaskRef,

    /// Current status
    pub status: RemoteTaskStatus,

    /// Progress in [0, 1]
    pub progress: f64,

    /// Task name (usually the API call, e.g. `Async.VM.start`)
    pub name: String,

    /// Free-form description
    pub description: String,

    /// Metadata map
    #[serde(default)]
    pub other_config: HashMap<String, String>,

    /// Parent task, `None` for top-level tasks
    pub subtask_of: Option<TaskRef>,

    /// Creation time on the remote clock
    pub created: Time,

    /// Error-info entries, set when the status is failure
    #[serde(default)]
    pub error_info: Vec<String>,
}

impl RemoteTask {
    /// A pending top-level task with empty metadata.
    pub fn pending(reference: impl Into<String>, name: impl Into<String>, created: Time) -> Self {
        Self {
            reference: TaskRef::new(reference),
            status: RemoteTaskStatus::Pending,
            progress: 0.0,
            name: name.into(),
            description: String::new(),
            other_config: HashMap::new(),
            subtask_of: None,
            created,
            error_info: Vec::new(),
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: RemoteTaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the progress fraction.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.other_config.insert(key.into(), value.into());
        self
    }

    /// Mark as a subtask of `parent`.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.subtask_of = Some(TaskRef::new(parent));
        self
    }

    /// Set the error-info list.
    pub fn with_error_info(mut self, error_info: Vec<String>) -> Self {
        self.error_info = error_info;
        self
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.other_config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Owner-id tag, if present.
    pub fn owner_id(&self) -> Option<&str> {
        self.metadata(metadata_keys::OWNER_ID)
    }

    /// Owner installation tag, if present.
    pub fn owner_installation(&self) -> Option<&str> {
        self.metadata(metadata_keys::OWNER_INSTALLATION)
    }

    /// `applies_to` tag, if present and non-empty.
    pub fn applies_to(&self) -> Option<&str> {
        self.metadata(metadata_keys::APPLIES_TO)
    }

    /// Correlation id left by the console that created the task.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.metadata(metadata_keys::CORRELATION_ID)
            .map(|v| CorrelationId(v.to_string()))
    }

    /// Operation code: the `operation` tag, or the task name without its
    /// `Async.` prefix.
    pub fn operation_code(&self) -> Option<&str> {
        if let Some(code) = self.metadata(metadata_keys::OPERATION) {
            return Some(code);
        }
        let name = self.name.strip_prefix("Async.").unwrap_or(&self.name);
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Whether the task is top-level.
    pub fn is_top_level(&self) -> bool {
        self.subtask_of.as_ref().map_or(true, TaskRef::is_null)
    }

    /// Progress as a whole percentage, clamped to 0..=100.
    pub fn percent_complete(&self) -> u8 {
        if !self.progress.is_finite() {
            return 0;
        }
        (self.progress * 100.0).clamp(0.0, 100.0) as u8
    }

    /// Records that cannot be classified.
    pub fn is_malformed(&self) -> bool {
        self.reference.is_null() || !self.progress.is_finite()
    }
}

/// Who this console is, as written into remote task metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Identity of the running process; tasks tagged with it already have a
    /// local operation.
    pub application_id: String,

    /// Identity of the installation; survives restarts.
    pub installation_id: String,
}

impl AppIdentity {
    /// Identity with explicit values.
    pub fn new(application_id: impl Into<String>, installation_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            installation_id: installation_id.into(),
        }
    }

    /// Fresh process identity for the given installation.
    pub fn for_installation(installation_id: impl Into<String>) -> Self {
        Self {
            application_id: ulid::Ulid::new().to_string(),
            installation_id: installation_id.into(),
        }
    }

    /// Whether the task was created by this process.
    pub fn created_by_this_process(&self, task: &RemoteTask) -> bool {
        task.owner_id() == Some(self.application_id.as_str())
    }

    /// Whether the task was created by this installation.
    pub fn created_by_this_installation(&self, task: &RemoteTask) -> bool {
        task.owner_installation() == Some(self.installation_id.as_str())
    }
}
