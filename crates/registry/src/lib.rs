//! Operation history (Layer 2)
//!
//! The process-wide table of operation records: correlation id assignment,
//! mirroring of operation changes, eviction and restart cleanup.

#![warn(missing_docs)]

pub mod record;
pub mod registry;

pub use record::{OperationRecord, RecordOutcome};
pub use registry::{OperationRegistry, RegistryConfig, RegistryEvent};
