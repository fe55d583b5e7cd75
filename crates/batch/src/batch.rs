//! Sequential and bounded-parallel composites.
//!
//! A batch owns its children. It reports the truncated mean of their
//! progress, republishes the active child's title and description as its
//! detail, and folds child failures into a single outcome:
//!
//! - no failure: success
//! - one failure: that child's failure, verbatim
//! - several failures: an aggregate whose details list every message in
//!   list order
//!
//! Cancelling the batch cancels every child that has not finished. So does
//! dropping it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use xenops_core::{OperationError, OperationFailure, OperationState};
use xenops_operation::{
    Operation, OperationBody, OperationDetail, OperationEvent, OperationField, WeakOperation,
};

struct BatchCore {
    children: Vec<Operation>,
    stop_on_first_failure: bool,
}

impl BatchCore {
    fn cascade_cancel(&self) {
        for child in &self.children {
            if !child.state().is_terminal() {
                child.cancel();
            }
        }
    }

    fn outcome(&self, parent: &Operation, failures: Vec<OperationFailure>) -> Result<(), OperationError> {
        if parent.is_cancel_requested() {
            return Err(OperationError::Cancelled);
        }
        let mut failures = failures;
        match failures.len() {
            0 => Ok(()),
            1 => {
                let failure = failures.remove(0);
                Err(OperationError::Failed {
                    message: failure.message,
                    details: failure.details,
                })
            }
            n => Err(OperationError::Aggregate {
                message: format!("{n} operations failed"),
                details: failures.into_iter().map(|f| f.message).collect(),
            }),
        }
    }
}

impl Drop for BatchCore {
    fn drop(&mut self) {
        self.cascade_cancel();
    }
}

fn child_failure(child: &Operation) -> Option<OperationFailure> {
    match child.state() {
        OperationState::Failed => Some(
            child
                .error()
                .unwrap_or_else(|| OperationFailure::new(format!("{} failed", child.title()))),
        ),
        _ => None,
    }
}

fn mean_progress(children: &[WeakOperation]) -> u8 {
    if children.is_empty() {
        return 0;
    }
    let total: u32 = children
        .iter()
        .map(|c| c.upgrade().map_or(0, |op| u32::from(op.percent_complete())))
        .sum();
    (total / children.len() as u32) as u8
}

fn detail_of(child: &Operation) -> OperationDetail {
    OperationDetail {
        title: child.title(),
        description: child.description(),
    }
}

/// Wrap `children` into a parent operation driven by `body`.
fn assemble(
    title: String,
    description: String,
    children: &[Operation],
    body: Arc<dyn OperationBody>,
) -> Operation {
    for child in children {
        child.set_suppress_from_history(true);
    }

    let mut builder = Operation::builder(title)
        .description(description)
        .can_cancel(children.iter().any(Operation::can_cancel));
    if let Some(endpoint) = shared_endpoint(children) {
        builder = builder.endpoint(endpoint);
    }
    let parent = builder.build_shared(body);

    let siblings: Arc<[WeakOperation]> = children.iter().map(Operation::downgrade).collect();
    parent.set_progress(mean_progress(&siblings));
    for child in children {
        let parent = parent.downgrade();
        let siblings = siblings.clone();
        child.subscribe(move |event| {
            let OperationEvent::Changed { field, snapshot } = event else {
                return;
            };
            if !matches!(
                field,
                OperationField::Progress
                    | OperationField::Title
                    | OperationField::Description
                    | OperationField::State
            ) {
                return;
            }
            let Some(parent) = parent.upgrade() else {
                return;
            };
            parent.set_progress(mean_progress(&siblings));
            if snapshot.state == OperationState::Running {
                parent.set_detail(Some(OperationDetail {
                    title: snapshot.title.clone(),
                    description: snapshot.description.clone(),
                }));
            }
        });
    }
    parent
}

fn shared_endpoint(children: &[Operation]) -> Option<xenops_core::EndpointId> {
    let first = children.first()?.endpoint()?;
    children
        .iter()
        .all(|c| c.endpoint().as_ref() == Some(&first))
        .then_some(first)
}

/// Runs its children one after another, in list order.
pub struct SequentialBatch {
    core: BatchCore,
}

impl SequentialBatch {
    /// Build the parent operation for `children`.
    pub fn build(
        title: impl Into<String>,
        description: impl Into<String>,
        children: Vec<Operation>,
        stop_on_first_failure: bool,
    ) -> Operation {
        let body = Arc::new(Self {
            core: BatchCore {
                children: children.clone(),
                stop_on_first_failure,
            },
        });
        assemble(title.into(), description.into(), &children, body)
    }
}

#[async_trait]
impl OperationBody for SequentialBatch {
    async fn run(&self, parent: &Operation) -> Result<(), OperationError> {
        let token = parent.cancellation_token();
        let mut failures = Vec::new();

        for (index, child) in self.core.children.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            parent.set_detail(Some(detail_of(child)));
            child.run_inline().await;

            if let Some(failure) = child_failure(child) {
                debug!(index, error = %failure, "batch child failed");
                failures.push(failure);
                if self.core.stop_on_first_failure {
                    break;
                }
            }
        }

        parent.set_detail(None);
        self.core.outcome(parent, failures)
    }

    fn on_cancel(&self, _parent: &Operation) {
        self.core.cascade_cancel();
    }

    async fn prepare_for_restart(&self, _parent: &Operation) {
        for child in &self.core.children {
            child.prepare_for_restart().await;
        }
    }
}

/// Runs up to a fixed number of children at once.
///
/// Siblings run in no particular order; the batch finishes once every
/// started child is terminal.
pub struct BoundedParallelBatch {
    core: BatchCore,
    max_parallel: usize,
}

impl BoundedParallelBatch {
    /// Build the parent operation for `children`.
    pub fn build(
        title: impl Into<String>,
        description: impl Into<String>,
        children: Vec<Operation>,
        max_parallel: usize,
        stop_on_first_failure: bool,
    ) -> Operation {
        let body = Arc::new(Self {
            core: BatchCore {
                children: children.clone(),
                stop_on_first_failure,
            },
            max_parallel: max_parallel.max(1),
        });
        assemble(title.into(), description.into(), &children, body)
    }
}

#[async_trait]
impl OperationBody for BoundedParallelBatch {
    async fn run(&self, parent: &Operation) -> Result<(), OperationError> {
        let halt = parent.cancellation_token().child_token();
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        let stop_on_first_failure = self.core.stop_on_first_failure;
        for (index, child) in self.core.children.iter().cloned().enumerate() {
            let permits = permits.clone();
            let halt = halt.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return index,
                    },
                    _ = halt.cancelled() => return index,
                };
                if halt.is_cancelled() {
                    return index;
                }
                child.run_inline().await;
                // Halt before the permit is released so no queued sibling
                // slips in.
                if stop_on_first_failure && child.state() == OperationState::Failed {
                    halt.cancel();
                }
                index
            });
        }

        let mut failures: Vec<(usize, OperationFailure)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let index = match joined {
                Ok(index) => index,
                Err(err) => {
                    warn!(error = %err, "batch child task aborted");
                    continue;
                }
            };
            if let Some(failure) = child_failure(&self.core.children[index]) {
                debug!(index, error = %failure, "batch child failed");
                failures.push((index, failure));
            }
        }

        parent.set_detail(None);
        failures.sort_by_key(|(index, _)| *index);
        self.core
            .outcome(parent, failures.into_iter().map(|(_, f)| f).collect())
    }

    fn on_cancel(&self, _parent: &Operation) {
        self.core.cascade_cancel();
    }

    async fn prepare_for_restart(&self, _parent: &Operation) {
        for child in &self.core.children {
            child.prepare_for_restart().await;
        }
    }
}
