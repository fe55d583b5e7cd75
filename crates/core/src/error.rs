//! Failure types for operations and the session layer.

use serde::{Deserialize, Serialize};

/// The failure recorded on an Operation that ended in `Failed`.
///
/// One primary message plus an ordered list of details, e.g. the parsed
/// error-info entries of a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Primary message
    pub message: String,
    /// Ordered detail strings
    pub details: Vec<String>,
}

impl OperationFailure {
    /// Create a failure without details.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach details.
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of an operation body that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The operation's own work failed
    #[error("{message}")]
    Failed {
        /// Primary message
        message: String,
        /// Ordered details
        details: Vec<String>,
    },

    /// The remote task reported failure
    #[error("{message}")]
    Remote {
        /// First error-info entry
        message: String,
        /// Full error-info list
        details: Vec<String>,
    },

    /// More than one child of a batch failed
    #[error("{message}")]
    Aggregate {
        /// Summary line
        message: String,
        /// One entry per failed child, in order
        details: Vec<String>,
    },

    /// The operation was cancelled; never presented as an error
    #[error("operation cancelled")]
    Cancelled,
}

impl OperationError {
    /// A local failure with no details.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Translate a remote error-info list. The first entry becomes the message.
    pub fn from_error_info(error_info: &[String]) -> Self {
        let message = error_info
            .first()
            .cloned()
            .unwrap_or_else(|| "remote task failed".to_string());
        Self::Remote {
            message,
            details: error_info.to_vec(),
        }
    }

    /// Whether this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert into the failure stored on the operation, if it is one.
    pub fn to_failure(&self) -> Option<OperationFailure> {
        match self {
            Self::Failed { message, details }
            | Self::Remote { message, details }
            | Self::Aggregate { message, details } => Some(OperationFailure {
                message: message.clone(),
                details: details.clone(),
            }),
            Self::Cancelled => None,
        }
    }
}

impl From<SessionError> for OperationError {
    fn from(err: SessionError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Result type for session calls.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Errors reported by the externally owned session layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session is not authenticated
    #[error("session for {0} is not logged in")]
    NotLoggedIn(String),

    /// The referenced task does not exist
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The control plane rejected the call
    #[error("remote call failed: {0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_translation_uses_first_entry() {
        let info = vec![
            "VM_BAD_POWER_STATE".to_string(),
            "OpaqueRef:vm".to_string(),
            "halted".to_string(),
        ];
        let err = OperationError::from_error_info(&info);
        let failure = err.to_failure().unwrap();
        assert_eq!(failure.message, "VM_BAD_POWER_STATE");
        assert_eq!(failure.details, info);
    }

    #[test]
    fn empty_error_info_still_fails() {
        let err = OperationError::from_error_info(&[]);
        assert_eq!(err.to_string(), "remote task failed");
    }

    #[test]
    fn cancelled_has_no_failure() {
        assert!(OperationError::Cancelled.is_cancelled());
        assert!(OperationError::Cancelled.to_failure().is_none());
    }
}
