//! Change notifications emitted by an Operation.

use serde::{Deserialize, Serialize};
use xenops_core::{CorrelationId, EndpointId, OperationFailure, OperationId, OperationState, TaskRef};

/// Handle returned by [`Operation::subscribe`](crate::Operation::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Which tracked field a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationField {
    /// Title
    Title,
    /// Description
    Description,
    /// Percent complete
    Progress,
    /// Lifecycle state (terminal transitions carry error/progress with them)
    State,
    /// Cancellation requested
    CancelRequested,
    /// Related remote task
    RelatedTask,
    /// Correlation id assigned
    CorrelationId,
    /// Active child detail
    Detail,
    /// History suppression toggled
    SuppressFromHistory,
}

/// Title and description of the piece of work currently active inside a
/// composite operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDetail {
    /// Title of the active child
    pub title: String,
    /// Description of the active child
    pub description: String,
}

/// Consistent copy of every observable field of an Operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot {
    /// Operation identity
    pub id: OperationId,
    /// Correlation id, once registered
    pub correlation_id: Option<CorrelationId>,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Progress, 0..=100
    pub percent_complete: u8,
    /// Lifecycle state
    pub state: OperationState,
    /// Remote task this operation is bound to
    pub related_task: Option<TaskRef>,
    /// Failure, when `state` is `Failed`
    pub error: Option<OperationFailure>,
    /// Cancellation has been requested
    pub cancel_requested: bool,
    /// Cancellation is allowed
    pub can_cancel: bool,
    /// Never recorded in history
    pub suppress_from_history: bool,
    /// Target endpoint, `None` for cross-endpoint composites
    pub endpoint: Option<EndpointId>,
    /// Active child detail for composites
    pub detail: Option<OperationDetail>,
    /// Bumped on every change; lets observers drop stale deliveries
    pub version: u64,
}

/// Notification delivered to listeners.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    /// A tracked field changed
    Changed {
        /// The field that changed
        field: OperationField,
        /// State after the change
        snapshot: OperationSnapshot,
    },
    /// The operation was destroyed
    Dropped {
        /// Identity of the destroyed operation
        id: OperationId,
    },
}
