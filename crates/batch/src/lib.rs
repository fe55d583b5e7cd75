//! Batch orchestration (Layer 4)
//!
//! Composite operations that own a list of children, and the launcher that
//! groups requested operations per endpoint.

#![warn(missing_docs)]

pub mod batch;
pub mod config;
pub mod launcher;

pub use batch::{BoundedParallelBatch, SequentialBatch};
pub use config::BatchConfig;
pub use launcher::{BatchLauncher, BatchStrategy, LaunchReport, LaunchRequest, Partition};
