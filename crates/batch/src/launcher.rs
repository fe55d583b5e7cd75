//! Connection-aware launching of operation sets.

use crate::batch::{BoundedParallelBatch, SequentialBatch};
use crate::config::BatchConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xenops_core::{EndpointId, SessionProvider};
use xenops_operation::Operation;
use xenops_registry::OperationRegistry;

/// How a partition with several members is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// One child at a time, in list order
    Sequential,
    /// Up to `max_parallel` children at once
    Parallel {
        /// Concurrency cap
        max_parallel: usize,
    },
}

/// What to launch and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Title of every wrapping batch
    pub title: String,
    /// Description of every wrapping batch; the endpoint name when empty
    pub description: String,
    /// Batch strategy
    pub strategy: BatchStrategy,
    /// Stop starting children after the first failure
    pub stop_on_first_failure: bool,
}

impl LaunchRequest {
    /// Sequential request that runs every child.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            strategy: BatchStrategy::Sequential,
            stop_on_first_failure: false,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run members in parallel.
    pub fn parallel(mut self, max_parallel: usize) -> Self {
        self.strategy = BatchStrategy::Parallel {
            max_parallel: max_parallel.max(1),
        };
        self
    }

    /// Set the failure policy.
    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }
}

/// Operations sharing a target endpoint.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Shared endpoint; `None` for cross-endpoint operations
    pub endpoint: Option<EndpointId>,
    /// Members, in request order
    pub operations: Vec<Operation>,
}

/// What [`BatchLauncher::launch`] did.
#[derive(Debug, Default)]
pub struct LaunchReport {
    /// Started operations (lone members or wrapping batches) with their tasks
    pub launched: Vec<(Operation, JoinHandle<()>)>,
    /// Partitions whose endpoint was unreachable
    pub skipped: Vec<Partition>,
}

/// Groups requested operations per endpoint and starts them.
pub struct BatchLauncher {
    registry: Arc<OperationRegistry>,
    sessions: Arc<dyn SessionProvider>,
    config: BatchConfig,
}

impl BatchLauncher {
    /// Create a launcher.
    pub fn new(registry: Arc<OperationRegistry>, sessions: Arc<dyn SessionProvider>, config: BatchConfig) -> Self {
        Self {
            registry,
            sessions,
            config,
        }
    }

    /// A request seeded from the configured defaults.
    pub fn request(&self, title: impl Into<String>) -> LaunchRequest {
        let request = LaunchRequest::new(title).stop_on_first_failure(self.config.stop_on_first_failure);
        if self.config.parallel {
            request.parallel(self.config.max_parallel)
        } else {
            request
        }
    }

    /// Split `operations` by target endpoint, keeping the order of first
    /// appearance. Operations without an endpoint form one partition.
    pub fn partition(operations: Vec<Operation>) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = Vec::new();
        for operation in operations {
            let endpoint = operation.endpoint();
            match partitions.iter_mut().find(|p| p.endpoint == endpoint) {
                Some(partition) => partition.operations.push(operation),
                None => partitions.push(Partition {
                    endpoint,
                    operations: vec![operation],
                }),
            }
        }
        partitions
    }

    /// Launch `operations` as described by `request`.
    ///
    /// Partitions whose endpoint is not reachable are skipped. A lone member
    /// is registered and started as is; larger partitions are wrapped in a
    /// batch first. Must be called from within a tokio runtime.
    pub fn launch(&self, request: &LaunchRequest, operations: Vec<Operation>) -> LaunchReport {
        let mut report = LaunchReport::default();

        for mut partition in Self::partition(operations) {
            if let Some(endpoint) = &partition.endpoint {
                if !self.sessions.is_reachable(endpoint) {
                    warn!(endpoint = %endpoint, count = partition.operations.len(), "endpoint unreachable; partition skipped");
                    report.skipped.push(partition);
                    continue;
                }
            }

            let operation = if partition.operations.len() == 1 {
                partition.operations.remove(0)
            } else {
                self.wrap(request, partition)
            };
            self.registry.register(&operation);
            debug!(operation = %operation.id(), title = %operation.title(), "launching");
            let handle = operation.start();
            report.launched.push((operation, handle));
        }

        info!(
            launched = report.launched.len(),
            skipped = report.skipped.len(),
            "launch finished"
        );
        report
    }

    fn wrap(&self, request: &LaunchRequest, partition: Partition) -> Operation {
        let description = if request.description.is_empty() {
            partition
                .endpoint
                .as_ref()
                .map(|e| e.display_name().to_string())
                .unwrap_or_default()
        } else {
            request.description.clone()
        };
        match request.strategy {
            BatchStrategy::Sequential => SequentialBatch::build(
                request.title.clone(),
                description,
                partition.operations,
                request.stop_on_first_failure,
            ),
            BatchStrategy::Parallel { max_parallel } => BoundedParallelBatch::build(
                request.title.clone(),
                description,
                partition.operations,
                max_parallel,
                request.stop_on_first_failure,
            ),
        }
    }
}
