//! Remote task reconciliation (Layer 3)
//!
//! Decides which remote tasks deserve local tracking and keeps a
//! [`MeddlingOperation`] per watched task:
//!
//! - **Rehydration**: tasks this installation started before a restart
//! - **Meddling**: tasks started by other clients, watched for visibility

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod meddling;
pub mod policy;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ReconcilerConfig;
pub use error::{ReconcileError, ReconcileResult};
pub use meddling::MeddlingOperation;
pub use policy::{AllowAll, AllowList, OperationCodePolicy, OperationTitles};
pub use reconciler::{
    Classification, Reconciler, ReconcilerEvent, RehydrateSummary, TaskCategory, UnwantedReason,
};
