//! Operations that watch remote work they did not start.

use crate::policy::OperationTitles;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use xenops_core::{
    EndpointId, OperationError, OperationState, RemoteSession, RemoteTask, TaskRef,
};
use xenops_operation::{remote_outcome, scrub_remote_task, Operation, OperationBody, RemoteTaskPoller};

/// Local tracker for a pre-existing remote task.
///
/// The wrapped [`Operation`] starts out `Running`. Its body never creates
/// remote work; it polls the task until the task finishes. Only tasks this
/// installation created ("ours") can be cancelled from here.
#[derive(Debug, Clone)]
pub struct MeddlingOperation {
    operation: Operation,
    endpoint: EndpointId,
    task: TaskRef,
    ours: bool,
    titles: Arc<OperationTitles>,
}

impl MeddlingOperation {
    /// Build a tracker from the first suitable snapshot of `task`.
    ///
    /// Only the descriptive fields of the snapshot are taken over; call
    /// [`apply`](Self::apply) once the operation is registered to bring its
    /// state in line with the task.
    pub fn new(
        session: Arc<dyn RemoteSession>,
        task: &RemoteTask,
        ours: bool,
        titles: Arc<OperationTitles>,
        poll_interval: Duration,
    ) -> Self {
        let endpoint = session.endpoint().clone();
        let body = MeddlingBody {
            session,
            task: task.reference.clone(),
            ours,
            titles: titles.clone(),
            poll_interval,
        };
        let operation = Operation::builder(titles.title_for(task))
            .description(task.description.clone())
            .endpoint(endpoint.clone())
            .related_task(task.reference.clone())
            .can_cancel(ours)
            .already_running()
            .build(body);
        operation.set_progress(task.percent_complete());
        if ours {
            if let Some(correlation) = task.correlation_id() {
                operation.assign_correlation_id(correlation);
            }
        }

        Self {
            operation,
            endpoint,
            task: task.reference.clone(),
            ours,
            titles,
        }
    }

    /// The tracking operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Endpoint the task lives on.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// The watched task.
    pub fn task_ref(&self) -> &TaskRef {
        &self.task
    }

    /// Whether this installation created the task.
    pub fn is_ours(&self) -> bool {
        self.ours
    }

    /// Forward a new snapshot. Returns `true` once the operation is terminal.
    pub fn apply(&self, task: &RemoteTask) -> bool {
        apply_snapshot(&self.operation, task, &self.titles)
    }

    /// The task record was deleted remotely; deletion normally follows
    /// success.
    pub fn mark_removed(&self) {
        if self.operation.complete() {
            debug!(task = %self.task, "task removed; tracker completed");
        }
    }
}

fn mirror_snapshot(operation: &Operation, task: &RemoteTask, titles: &OperationTitles) {
    operation.set_title(titles.title_for(task));
    operation.set_description(task.description.clone());
    operation.set_progress(task.percent_complete());
}

fn apply_snapshot(operation: &Operation, task: &RemoteTask, titles: &OperationTitles) -> bool {
    mirror_snapshot(operation, task, titles);
    match remote_outcome(task) {
        None => {}
        Some(Ok(())) => {
            operation.complete();
        }
        Some(Err(OperationError::Cancelled)) => {
            operation.set_state(OperationState::Cancelled);
        }
        Some(Err(err)) => {
            if let Some(failure) = err.to_failure() {
                operation.set_error(failure.message, failure.details);
            }
        }
    }
    operation.state().is_terminal()
}

struct MeddlingBody {
    session: Arc<dyn RemoteSession>,
    task: TaskRef,
    ours: bool,
    titles: Arc<OperationTitles>,
    poll_interval: Duration,
}

#[async_trait]
impl OperationBody for MeddlingBody {
    async fn run(&self, operation: &Operation) -> Result<(), OperationError> {
        let titles = self.titles.clone();
        RemoteTaskPoller::new(self.session.clone(), self.task.clone())
            .with_interval(self.poll_interval)
            .with_remote_cancel(false)
            .run_with(operation, move |op, task| mirror_snapshot(op, task, &titles))
            .await
    }

    fn accepts_cancel(&self, _operation: &Operation) -> bool {
        if !self.ours {
            info!(task = %self.task, "task not started by this console; cancel ignored");
            return false;
        }
        if !self.session.is_logged_in() {
            warn!(task = %self.task, endpoint = %self.session.endpoint(), "cannot cancel task: session not logged in");
            return false;
        }
        true
    }

    fn on_cancel(&self, _operation: &Operation) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(task = %self.task, "cannot cancel task: no runtime");
            return;
        };
        let session = self.session.clone();
        let task = self.task.clone();
        handle.spawn(async move {
            match session.cancel_task(&task).await {
                Ok(()) => info!(task = %task, "remote cancellation requested"),
                Err(err) => warn!(task = %task, error = %err, "remote cancellation failed"),
            }
        });
    }

    async fn prepare_for_restart(&self, _operation: &Operation) {
        if !self.ours {
            return;
        }
        if let Err(err) = scrub_remote_task(self.session.as_ref(), &self.task).await {
            warn!(task = %self.task, error = %err, "failed to scrub ownership tags");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;
    use chrono::Utc;
    use xenops_core::{metadata_keys, CorrelationId, RemoteTaskStatus};

    fn pending(reference: &str) -> RemoteTask {
        RemoteTask::pending(reference, "Async.VM.start", Utc::now()).with_progress(0.25)
    }

    fn meddle(session: &Arc<MockSession>, task: &RemoteTask, ours: bool) -> MeddlingOperation {
        MeddlingOperation::new(
            session.clone(),
            task,
            ours,
            Arc::new(OperationTitles::default()),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn starts_running_with_task_details() {
        let session = Arc::new(MockSession::new("pool-a"));
        let meddling = meddle(&session, &pending("OpaqueRef:t1"), false);
        let op = meddling.operation();
        assert_eq!(op.state(), OperationState::Running);
        assert_eq!(op.title(), "Starting VM");
        assert_eq!(op.percent_complete(), 25);
        assert_eq!(op.endpoint(), Some(EndpointId::new("pool-a")));
        assert_eq!(op.related_task(), Some(TaskRef::new("OpaqueRef:t1")));
        assert!(!op.can_cancel());
    }

    #[test]
    fn apply_translates_remote_status() {
        let session = Arc::new(MockSession::new("pool-a"));
        let task = pending("OpaqueRef:t1");
        let meddling = meddle(&session, &task, false);

        assert!(!meddling.apply(&task.clone().with_progress(0.5)));
        assert_eq!(meddling.operation().percent_complete(), 50);

        let failed = task
            .with_status(RemoteTaskStatus::Failure)
            .with_error_info(vec!["VM_BAD_POWER_STATE".to_string(), "halted".to_string()]);
        assert!(meddling.apply(&failed));
        let error = meddling.operation().error().unwrap();
        assert_eq!(error.message, "VM_BAD_POWER_STATE");
        assert_eq!(error.details, vec!["VM_BAD_POWER_STATE", "halted"]);
    }

    #[test]
    fn remote_cancellation_is_not_a_failure() {
        let session = Arc::new(MockSession::new("pool-a"));
        let task = pending("OpaqueRef:t1");
        let meddling = meddle(&session, &task, false);
        assert!(meddling.apply(&task.with_status(RemoteTaskStatus::Cancelled)));
        assert_eq!(meddling.operation().state(), OperationState::Cancelled);
        assert!(meddling.operation().error().is_none());
    }

    #[test]
    fn removal_completes() {
        let session = Arc::new(MockSession::new("pool-a"));
        let meddling = meddle(&session, &pending("OpaqueRef:t1"), false);
        meddling.mark_removed();
        assert_eq!(meddling.operation().state(), OperationState::Completed);
        assert_eq!(meddling.operation().percent_complete(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_foreign_task_is_a_no_op() {
        let session = Arc::new(MockSession::new("pool-a"));
        let meddling = meddle(&session, &pending("OpaqueRef:t1"), false);

        assert!(!meddling.operation().cancel());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(session.cancels.lock().is_empty());
        assert_eq!(meddling.operation().state(), OperationState::Running);
        assert!(!meddling.operation().is_cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_own_task_goes_to_the_control_plane() {
        let session = Arc::new(MockSession::new("pool-a"));
        let meddling = meddle(&session, &pending("OpaqueRef:t1"), true);

        assert!(meddling.operation().cancel());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(session.cancels.lock().as_slice(), &[TaskRef::new("OpaqueRef:t1")]);
        // Local state follows the control plane's acknowledgement.
        assert_eq!(meddling.operation().state(), OperationState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn own_task_cancel_without_login_is_refused() {
        let session = Arc::new(MockSession::new("pool-a"));
        session.set_logged_in(false);
        let meddling = meddle(&session, &pending("OpaqueRef:t1"), true);

        assert!(!meddling.operation().cancel());
        assert!(!meddling.operation().is_cancel_requested());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(session.cancels.lock().is_empty());

        // Once logged in again the request goes through.
        session.set_logged_in(true);
        assert!(meddling.operation().cancel());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(session.cancels.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_the_task_finishes() {
        let session = Arc::new(MockSession::new("pool-a"));
        let task = pending("OpaqueRef:t1");
        session.put(task.clone());
        let meddling = meddle(&session, &task, false);

        let handle = meddling.operation().start();
        tokio::time::sleep(Duration::from_millis(25)).await;
        session.put(task.clone().with_progress(0.75));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(meddling.operation().percent_complete(), 75);

        session.put(task.with_status(RemoteTaskStatus::Success).with_progress(1.0));
        handle.await.unwrap();
        assert_eq!(meddling.operation().state(), OperationState::Completed);
    }

    #[tokio::test]
    async fn own_task_adopts_correlation_and_scrubs_on_restart() {
        let session = Arc::new(MockSession::new("pool-a"));
        let task = pending("OpaqueRef:t1")
            .with_metadata(metadata_keys::OWNER_ID, "previous-process")
            .with_metadata(metadata_keys::OWNER_INSTALLATION, "install-1")
            .with_metadata(metadata_keys::CORRELATION_ID, "op_previous")
            .with_metadata(metadata_keys::APPLIES_TO, "vm-1");
        session.put(task.clone());
        let meddling = meddle(&session, &task, true);
        assert_eq!(
            meddling.operation().correlation_id(),
            Some(CorrelationId("op_previous".to_string()))
        );

        meddling.operation().prepare_for_restart().await;
        let tasks = session.tasks.lock();
        let scrubbed = &tasks[&TaskRef::new("OpaqueRef:t1")];
        assert!(scrubbed.owner_id().is_none());
        assert!(scrubbed.owner_installation().is_none());
        assert!(scrubbed.correlation_id().is_none());
        assert_eq!(scrubbed.applies_to(), Some("vm-1"));
    }

    #[tokio::test]
    async fn foreign_task_is_left_untouched_on_restart() {
        let session = Arc::new(MockSession::new("pool-a"));
        let task = pending("OpaqueRef:t1").with_metadata(metadata_keys::OWNER_ID, "someone-else");
        session.put(task.clone());
        let meddling = meddle(&session, &task, false);

        meddling.operation().prepare_for_restart().await;
        assert_eq!(session.tasks.lock()[&TaskRef::new("OpaqueRef:t1")].owner_id(), Some("someone-else"));
    }
}
