//! XenOps core data models.
//!
//! This crate defines the vocabulary shared by every layer of the
//! operation-tracking subsystem: identifiers, the operation state machine
//! states, the remote task model, the session abstraction consumed from the
//! connection layer, and the clock/id providers.

#![warn(missing_docs)]

// Core identities
mod id;

// Operation state and failures
mod state;
mod error;

// Remote side
mod task;
pub mod session;

// Time and id sources
pub mod provider;

// Re-exports
pub use id::*;

pub use state::OperationState;
pub use error::{OperationError, OperationFailure, SessionError, SessionResult};
pub use task::{metadata_keys, AppIdentity, RemoteTask, RemoteTaskStatus};
pub use session::{RemoteSession, SessionProvider, StaticSessionProvider};
pub use provider::{Clock, IdGenerator, ManualClock, SystemClock, UlidGenerator};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
