//! Operations bound to a remote task: poll-to-completion and ownership tags.

use crate::operation::Operation;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use xenops_core::{
    metadata_keys, AppIdentity, OperationError, RemoteSession, RemoteTask, RemoteTaskStatus,
    SessionError, SessionResult, TaskRef,
};

/// Default interval between two polls of a remote task.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(900);

/// Translate a task snapshot into a local outcome. `None` while pending.
pub fn remote_outcome(task: &RemoteTask) -> Option<Result<(), OperationError>> {
    match task.status {
        RemoteTaskStatus::Pending => None,
        RemoteTaskStatus::Success => Some(Ok(())),
        RemoteTaskStatus::Failure => Some(Err(OperationError::from_error_info(&task.error_info))),
        RemoteTaskStatus::Cancelled => Some(Err(OperationError::Cancelled)),
    }
}

/// Polls a remote task until it finishes.
pub struct RemoteTaskPoller {
    session: Arc<dyn RemoteSession>,
    task: TaskRef,
    interval: Duration,
    cancel_remotely: bool,
}

impl RemoteTaskPoller {
    /// Poll `task` through `session`.
    pub fn new(session: Arc<dyn RemoteSession>, task: TaskRef) -> Self {
        Self {
            session,
            task,
            interval: DEFAULT_POLL_INTERVAL,
            cancel_remotely: true,
        }
    }

    /// Set the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether a local cancellation is forwarded to the control plane.
    pub fn with_remote_cancel(mut self, cancel_remotely: bool) -> Self {
        self.cancel_remotely = cancel_remotely;
        self
    }

    /// Poll, mirroring progress into `operation`.
    pub async fn run(&self, operation: &Operation) -> Result<(), OperationError> {
        self.run_with(operation, |op, task| {
            op.set_progress(task.percent_complete());
        })
        .await
    }

    /// Poll, handing every snapshot to `on_snapshot` before its status is
    /// translated.
    ///
    /// Returns as soon as the task reaches a terminal status, disappears, or
    /// the operation itself became terminal through some other path.
    pub async fn run_with<F>(&self, operation: &Operation, mut on_snapshot: F) -> Result<(), OperationError>
    where
        F: FnMut(&Operation, &RemoteTask) + Send,
    {
        let token = operation.cancellation_token();
        let mut cancel_sent = false;

        loop {
            if operation.state().is_terminal() {
                debug!(task = %self.task, "operation finished elsewhere; polling stopped");
                return Ok(());
            }

            if token.is_cancelled() && !cancel_sent {
                cancel_sent = true;
                if self.cancel_remotely {
                    self.request_remote_cancel().await;
                }
            }

            match self.session.get_task(&self.task).await {
                Ok(Some(task)) => {
                    on_snapshot(operation, &task);
                    if let Some(outcome) = remote_outcome(&task) {
                        return outcome;
                    }
                }
                Ok(None) => {
                    debug!(task = %self.task, "task record removed; treating as completed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(task = %self.task, error = %err, "failed to poll task");
                }
            }

            if cancel_sent {
                tokio::time::sleep(self.interval).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = token.cancelled() => {}
                }
            }
        }
    }

    async fn request_remote_cancel(&self) {
        if !self.session.is_logged_in() {
            warn!(task = %self.task, endpoint = %self.session.endpoint(), "cannot cancel task: session not logged in");
            return;
        }
        match self.session.cancel_task(&self.task).await {
            Ok(()) => info!(task = %self.task, "remote cancellation requested"),
            Err(err) => warn!(task = %self.task, error = %err, "remote cancellation failed"),
        }
    }
}

/// Tag a task this console created so it can be recognised after a
/// reconnect, and bind `operation` to it.
pub async fn claim_remote_task(
    operation: &Operation,
    session: &dyn RemoteSession,
    task: &TaskRef,
    identity: &AppIdentity,
    applies_to: &[String],
) -> SessionResult<()> {
    operation.set_related_task(task.clone());
    session
        .set_task_metadata(task, metadata_keys::OWNER_ID, &identity.application_id)
        .await?;
    session
        .set_task_metadata(task, metadata_keys::OWNER_INSTALLATION, &identity.installation_id)
        .await?;
    if let Some(correlation) = operation.correlation_id() {
        session
            .set_task_metadata(task, metadata_keys::CORRELATION_ID, correlation.as_str())
            .await?;
    }
    if !applies_to.is_empty() {
        session
            .set_task_metadata(task, metadata_keys::APPLIES_TO, &applies_to.join(","))
            .await?;
    }
    Ok(())
}

/// Remove the ownership tags from a task.
pub async fn scrub_remote_task(session: &dyn RemoteSession, task: &TaskRef) -> SessionResult<()> {
    if !session.is_logged_in() {
        return Err(SessionError::NotLoggedIn(session.endpoint().to_string()));
    }
    for key in metadata_keys::OWNERSHIP {
        session.remove_task_metadata(task, key).await?;
    }
    debug!(task = %task, "ownership tags removed");
    Ok(())
}
