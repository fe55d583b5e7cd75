//! Reconciliation anomalies.
//!
//! None of these ever become an Operation error; callers log them and move
//! on. A task that hit one is retried on the next full enumeration.

use xenops_core::{EndpointId, SessionError, TaskRef};

/// Result type for reconciliation.
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// Errors that can occur while reconciling remote tasks.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Record with a null reference or unusable fields
    #[error("Malformed task record: {0}")]
    MalformedTask(TaskRef),

    /// No connection backs the endpoint
    #[error("No session for endpoint {0}")]
    NoSession(EndpointId),

    /// The session failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}
