//! Operations (Layer 1)
//!
//! The asynchronous-operation state machine, the body trait that supplies an
//! operation's work, and helpers for operations bound to a remote task.

#![warn(missing_docs)]

pub mod body;
pub mod event;
pub mod operation;
pub mod remote;

pub use body::{FnBody, OperationBody};
pub use event::{ListenerId, OperationDetail, OperationEvent, OperationField, OperationSnapshot};
pub use operation::{Operation, OperationBuilder, WeakOperation};
pub use remote::{claim_remote_task, remote_outcome, scrub_remote_task, RemoteTaskPoller};
