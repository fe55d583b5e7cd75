//! Which operation codes are watched, and how they are titled.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use xenops_core::RemoteTask;

/// Decides whether tasks of a given operation class are worth watching.
pub trait OperationCodePolicy: Send + Sync + Debug {
    /// Whether `code` is recognized. `None` means the task carries no code.
    fn is_recognized(&self, code: Option<&str>) -> bool;
}

/// Watches every task.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl OperationCodePolicy for AllowAll {
    fn is_recognized(&self, _code: Option<&str>) -> bool {
        true
    }
}

/// Watches only the listed codes.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    codes: HashSet<String>,
}

impl AllowList {
    /// Create an allow-list.
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a code.
    pub fn allow(mut self, code: impl Into<String>) -> Self {
        self.codes.insert(code.into());
        self
    }
}

impl OperationCodePolicy for AllowList {
    fn is_recognized(&self, code: Option<&str>) -> bool {
        code.map_or(false, |c| self.codes.contains(c))
    }
}

const BUILTIN_TITLES: &[(&str, &str)] = &[
    ("VM.start", "Starting VM"),
    ("VM.start_on", "Starting VM on host"),
    ("VM.clean_shutdown", "Shutting down VM"),
    ("VM.hard_shutdown", "Forcing VM shutdown"),
    ("VM.clean_reboot", "Rebooting VM"),
    ("VM.hard_reboot", "Forcing VM reboot"),
    ("VM.suspend", "Suspending VM"),
    ("VM.resume", "Resuming VM"),
    ("VM.pool_migrate", "Migrating VM"),
    ("VM.migrate_send", "Migrating VM across pools"),
    ("VM.clone", "Cloning VM"),
    ("VM.copy", "Copying VM"),
    ("VM.snapshot", "Taking snapshot"),
    ("VM.checkpoint", "Taking checkpoint"),
    ("VM.revert", "Reverting to snapshot"),
    ("VM.destroy", "Deleting VM"),
    ("VM.import", "Importing VM"),
    ("VM.export", "Exporting VM"),
    ("SR.create", "Creating storage repository"),
    ("SR.scan", "Scanning storage repository"),
    ("SR.destroy", "Destroying storage repository"),
    ("VDI.create", "Creating virtual disk"),
    ("VDI.copy", "Copying virtual disk"),
    ("VDI.resize", "Resizing virtual disk"),
    ("host.evacuate", "Evacuating host"),
    ("host.reboot", "Rebooting host"),
    ("pool.join", "Joining pool"),
    ("pool.eject", "Removing host from pool"),
];

/// Human titles for recognized operation codes.
#[derive(Debug, Clone)]
pub struct OperationTitles {
    titles: HashMap<String, String>,
}

impl Default for OperationTitles {
    fn default() -> Self {
        Self {
            titles: BUILTIN_TITLES
                .iter()
                .map(|(code, title)| (code.to_string(), title.to_string()))
                .collect(),
        }
    }
}

impl OperationTitles {
    /// A table without any entries.
    pub fn empty() -> Self {
        Self {
            titles: HashMap::new(),
        }
    }

    /// Add or replace an entry.
    pub fn with_title(mut self, code: impl Into<String>, title: impl Into<String>) -> Self {
        self.titles.insert(code.into(), title.into());
        self
    }

    /// Title registered for `code`.
    pub fn lookup(&self, code: &str) -> Option<&str> {
        self.titles.get(code).map(String::as_str)
    }

    /// Title for a task: the table entry for its operation code, else its
    /// raw name, else its description.
    pub fn title_for(&self, task: &RemoteTask) -> String {
        if let Some(title) = task.operation_code().and_then(|code| self.lookup(code)) {
            return title.to_string();
        }
        if !task.name.is_empty() {
            return task.name.clone();
        }
        task.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use xenops_core::metadata_keys;

    #[test]
    fn allow_list_rejects_unknown_and_missing_codes() {
        let policy = AllowList::new(["VM.start"]).allow("VM.copy");
        assert!(policy.is_recognized(Some("VM.start")));
        assert!(policy.is_recognized(Some("VM.copy")));
        assert!(!policy.is_recognized(Some("VM.destroy")));
        assert!(!policy.is_recognized(None));
        assert!(AllowAll.is_recognized(None));
    }

    #[test]
    fn title_prefers_metadata_code() {
        let titles = OperationTitles::default();
        let task = RemoteTask::pending("OpaqueRef:1", "Async.VM.start", Utc::now());
        assert_eq!(titles.title_for(&task), "Starting VM");

        let tagged = RemoteTask::pending("OpaqueRef:2", "Async.VM.copy", Utc::now())
            .with_metadata(metadata_keys::OPERATION, "VM.snapshot");
        assert_eq!(titles.title_for(&tagged), "Taking snapshot");
    }

    #[test]
    fn unknown_codes_fall_back_to_name_then_description() {
        let titles = OperationTitles::empty().with_title("custom.op", "Custom");
        let named = RemoteTask::pending("OpaqueRef:1", "Async.VM.start", Utc::now());
        assert_eq!(titles.title_for(&named), "Async.VM.start");

        let anonymous =
            RemoteTask::pending("OpaqueRef:2", "", Utc::now()).with_description("vendor plugin call");
        assert_eq!(titles.title_for(&anonymous), "vendor plugin call");
    }
}
