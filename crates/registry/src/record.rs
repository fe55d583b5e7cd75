//! History entries.

use xenops_core::{
    CorrelationId, EndpointId, OperationFailure, OperationId, OperationState, RecordId, TaskRef,
    Time,
};
use xenops_operation::{Operation, OperationDetail, OperationSnapshot, WeakOperation};

/// Observation-only copy of an Operation, kept after the Operation is gone.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Record identity
    pub id: RecordId,
    /// Identity of the mirrored operation
    pub operation_id: OperationId,
    /// Correlation id of the mirrored operation
    pub correlation_id: Option<CorrelationId>,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Progress, 0..=100
    pub percent_complete: u8,
    /// Lifecycle state
    pub state: OperationState,
    /// Failure, when failed
    pub error: Option<OperationFailure>,
    /// Remote task the operation is bound to
    pub related_task: Option<TaskRef>,
    /// Target endpoint
    pub endpoint: Option<EndpointId>,
    /// Whether cancel is offered
    pub can_cancel: bool,
    /// Whether cancel was requested
    pub cancel_requested: bool,
    /// Active child of a composite
    pub detail: Option<OperationDetail>,
    /// First observed running
    pub started_at: Option<Time>,
    /// First observed terminal
    pub finished_at: Option<Time>,
    operation: Option<WeakOperation>,
    version: u64,
}

/// How a record should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome<'a> {
    /// Not started or running
    InProgress,
    /// Completed
    Succeeded,
    /// Failed, with its failure
    Failed(Option<&'a OperationFailure>),
    /// Cancelled; never framed as an error
    Cancelled,
}

impl OperationRecord {
    pub(crate) fn new(operation: &Operation, snapshot: &OperationSnapshot, now: Time) -> Self {
        let mut record = Self {
            id: RecordId::new(),
            operation_id: snapshot.id,
            correlation_id: None,
            title: String::new(),
            description: String::new(),
            percent_complete: 0,
            state: OperationState::NotStarted,
            error: None,
            related_task: None,
            endpoint: None,
            can_cancel: false,
            cancel_requested: false,
            detail: None,
            started_at: None,
            finished_at: None,
            operation: Some(operation.downgrade()),
            version: 0,
        };
        record.copy_from(snapshot, now);
        record
    }

    /// Mirror `snapshot` unless it is older than what the record holds.
    pub(crate) fn mirror(&mut self, snapshot: &OperationSnapshot, now: Time) -> bool {
        if snapshot.version <= self.version {
            return false;
        }
        self.copy_from(snapshot, now);
        true
    }

    fn copy_from(&mut self, snapshot: &OperationSnapshot, now: Time) {
        self.correlation_id = snapshot.correlation_id.clone();
        self.title = snapshot.title.clone();
        self.description = snapshot.description.clone();
        self.percent_complete = snapshot.percent_complete;
        self.state = snapshot.state;
        self.error = snapshot.error.clone();
        self.related_task = snapshot.related_task.clone();
        self.endpoint = snapshot.endpoint.clone();
        self.can_cancel = snapshot.can_cancel;
        self.cancel_requested = snapshot.cancel_requested;
        self.detail = snapshot.detail.clone();
        self.version = snapshot.version;

        if snapshot.state != OperationState::NotStarted && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if snapshot.state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    pub(crate) fn detach(&mut self) {
        self.operation = None;
    }

    pub(crate) fn weak_operation(&self) -> Option<&WeakOperation> {
        self.operation.as_ref()
    }

    /// The live operation, if it still exists.
    pub fn operation(&self) -> Option<Operation> {
        self.operation.as_ref().and_then(WeakOperation::upgrade)
    }

    /// Whether the operation behind this record has been destroyed.
    pub fn is_orphaned(&self) -> bool {
        self.operation.as_ref().map_or(true, WeakOperation::is_dropped)
    }

    /// Presentation outcome.
    pub fn outcome(&self) -> RecordOutcome<'_> {
        match self.state {
            OperationState::NotStarted | OperationState::Running => RecordOutcome::InProgress,
            OperationState::Completed => RecordOutcome::Succeeded,
            OperationState::Failed => RecordOutcome::Failed(self.error.as_ref()),
            OperationState::Cancelled => RecordOutcome::Cancelled,
        }
    }

    /// Duration between start and finish, when both are known.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
