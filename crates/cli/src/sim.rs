//! In-memory control plane.
//!
//! Holds task records, publishes a change feed, and can drive a task through
//! a scripted lifetime. Stands in for a real pool connection in the CLI and
//! in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xenops_core::{
    AppIdentity, Clock, EndpointId, OperationError, RemoteSession, RemoteTask, RemoteTaskStatus,
    SessionError, SessionResult, TaskRef,
};
use xenops_operation::{claim_remote_task, scrub_remote_task, Operation, OperationBody, RemoteTaskPoller};
use xenops_reconcile::{ReconcileError, Reconciler};

/// One entry of the change feed.
#[derive(Debug, Clone)]
pub enum TaskChange {
    /// A task record appeared
    Added(RemoteTask),
    /// A task record changed
    Updated(RemoteTask),
    /// A task record was deleted
    Removed(TaskRef),
}

/// Scripted lifetime of a simulated task.
#[derive(Debug, Clone)]
pub struct TaskScript {
    /// Number of progress steps
    pub steps: u32,
    /// Delay between steps
    pub step: Duration,
    /// Final status
    pub outcome: RemoteTaskStatus,
    /// Error info set on failure
    pub error_info: Vec<String>,
    /// Delete the record this long after it finished
    pub remove_after: Option<Duration>,
}

impl TaskScript {
    /// Succeed after `steps` steps of `step`.
    pub fn succeed(steps: u32, step: Duration) -> Self {
        Self {
            steps,
            step,
            outcome: RemoteTaskStatus::Success,
            error_info: Vec::new(),
            remove_after: None,
        }
    }

    /// Fail with `error_info` after `steps` steps of `step`.
    pub fn fail(steps: u32, step: Duration, error_info: Vec<String>) -> Self {
        Self {
            outcome: RemoteTaskStatus::Failure,
            error_info,
            ..Self::succeed(steps, step)
        }
    }

    /// Delete the record once finished.
    pub fn then_remove(mut self, after: Duration) -> Self {
        self.remove_after = Some(after);
        self
    }
}

/// A simulated pool.
pub struct SimulatedEndpoint {
    endpoint: EndpointId,
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<TaskRef, RemoteTask>>,
    next_ref: AtomicU64,
    logged_in: AtomicBool,
    changes: broadcast::Sender<TaskChange>,
}

impl SimulatedEndpoint {
    /// Create an empty endpoint.
    pub fn new(endpoint: impl Into<String>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            endpoint: EndpointId::new(endpoint),
            clock,
            tasks: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
            logged_in: AtomicBool::new(true),
            changes,
        })
    }

    /// Subscribe to the change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.changes.subscribe()
    }

    /// Log the session in or out.
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    /// A fresh task reference.
    pub fn next_reference(&self) -> TaskRef {
        TaskRef::new(format!("OpaqueRef:sim-{}", self.next_ref.fetch_add(1, Ordering::Relaxed)))
    }

    /// Create a pending top-level task now.
    pub fn create_task(&self, name: &str) -> RemoteTask {
        let task = RemoteTask::pending(self.next_reference().0, name, self.clock.now());
        self.insert(task.clone());
        task
    }

    /// Add a fully formed record.
    pub fn insert(&self, task: RemoteTask) {
        self.tasks.lock().insert(task.reference.clone(), task.clone());
        self.publish(TaskChange::Added(task));
    }

    /// Modify a record. Returns the new record, `None` if it does not exist.
    pub fn update<F>(&self, task: &TaskRef, f: F) -> Option<RemoteTask>
    where
        F: FnOnce(&mut RemoteTask),
    {
        let updated = {
            let mut tasks = self.tasks.lock();
            let record = tasks.get_mut(task)?;
            f(record);
            record.clone()
        };
        self.publish(TaskChange::Updated(updated.clone()));
        Some(updated)
    }

    /// Delete a record.
    pub fn remove(&self, task: &TaskRef) -> bool {
        let removed = self.tasks.lock().remove(task).is_some();
        if removed {
            self.publish(TaskChange::Removed(task.clone()));
        }
        removed
    }

    /// Current copy of a record.
    pub fn task(&self, task: &TaskRef) -> Option<RemoteTask> {
        self.tasks.lock().get(task).cloned()
    }

    fn publish(&self, change: TaskChange) {
        let _ = self.changes.send(change);
    }

    /// Play `script` on `task` from a background task.
    pub fn drive(self: &Arc<Self>, task: TaskRef, script: TaskScript) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let steps = script.steps.max(1);
            for step in 1..=steps {
                tokio::time::sleep(script.step).await;
                let progress = f64::from(step) / f64::from(steps);
                let still_pending = endpoint
                    .update(&task, |t| {
                        if t.status == RemoteTaskStatus::Pending {
                            t.progress = progress.min(0.99);
                        }
                    })
                    .map_or(false, |t| t.status == RemoteTaskStatus::Pending);
                if !still_pending {
                    debug!(task = %task, "scripted task stopped early");
                    return;
                }
            }

            endpoint.update(&task, |t| {
                t.status = script.outcome;
                if script.outcome == RemoteTaskStatus::Success {
                    t.progress = 1.0;
                }
                t.error_info = script.error_info.clone();
            });

            if let Some(after) = script.remove_after {
                tokio::time::sleep(after).await;
                endpoint.remove(&task);
            }
        })
    }
}

#[async_trait]
impl RemoteSession for SimulatedEndpoint {
    fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_task(&self, task: &TaskRef) -> SessionResult<Option<RemoteTask>> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn(self.endpoint.to_string()));
        }
        Ok(self.task(task))
    }

    async fn enumerate_tasks(&self) -> SessionResult<HashMap<TaskRef, RemoteTask>> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn(self.endpoint.to_string()));
        }
        Ok(self.tasks.lock().clone())
    }

    async fn cancel_task(&self, task: &TaskRef) -> SessionResult<()> {
        self.update(task, |t| {
            if t.status == RemoteTaskStatus::Pending {
                t.status = RemoteTaskStatus::Cancelled;
            }
        })
        .map(|_| ())
        .ok_or_else(|| SessionError::TaskNotFound(task.to_string()))
    }

    async fn set_task_metadata(&self, task: &TaskRef, key: &str, value: &str) -> SessionResult<()> {
        self.update(task, |t| {
            t.other_config.insert(key.to_string(), value.to_string());
        })
        .map(|_| ())
        .ok_or_else(|| SessionError::TaskNotFound(task.to_string()))
    }

    async fn remove_task_metadata(&self, task: &TaskRef, key: &str) -> SessionResult<()> {
        self.update(task, |t| {
            t.other_config.remove(key);
        })
        .map(|_| ())
        .ok_or_else(|| SessionError::TaskNotFound(task.to_string()))
    }
}

/// Feed `endpoint`'s change stream into `reconciler` until `shutdown` fires.
///
/// A lagging receiver has lost notifications, so it falls back to a full
/// rehydration.
pub fn pump_changes(
    reconciler: Arc<Reconciler>,
    endpoint: EndpointId,
    mut changes: broadcast::Receiver<TaskChange>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => change,
            };
            match change {
                Ok(TaskChange::Added(task)) => report(reconciler.on_task_added(&endpoint, &task).err()),
                Ok(TaskChange::Updated(task)) => report(reconciler.on_task_updated(&endpoint, &task).err()),
                Ok(TaskChange::Removed(task)) => reconciler.on_task_removed(&endpoint, &task),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(endpoint = %endpoint, missed, "change feed lagged; rehydrating");
                    report(reconciler.rehydrate(&endpoint).await.err());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(endpoint = %endpoint, "change pump stopped");
    })
}

fn report(anomaly: Option<ReconcileError>) {
    if let Some(err) = anomaly {
        debug!(error = %err, "reconciliation anomaly");
    }
}

/// Local operation that starts work on a simulated endpoint, tags it as
/// ours, and polls it to completion. Preparing it for restart removes the
/// tags again.
pub struct SimulatedWork {
    endpoint: Arc<SimulatedEndpoint>,
    identity: AppIdentity,
    name: String,
    applies_to: Vec<String>,
    script: TaskScript,
    poll_interval: Duration,
}

impl SimulatedWork {
    /// Build the operation.
    pub fn operation(
        title: impl Into<String>,
        endpoint: Arc<SimulatedEndpoint>,
        identity: AppIdentity,
        name: impl Into<String>,
        applies_to: Vec<String>,
        script: TaskScript,
        poll_interval: Duration,
    ) -> Operation {
        let endpoint_id = endpoint.endpoint.clone();
        Operation::builder(title)
            .endpoint(endpoint_id)
            .build(Self {
                endpoint,
                identity,
                name: name.into(),
                applies_to,
                script,
                poll_interval,
            })
    }
}

#[async_trait]
impl OperationBody for SimulatedWork {
    async fn run(&self, operation: &Operation) -> Result<(), OperationError> {
        let task = self.endpoint.create_task(&self.name);
        claim_remote_task(
            operation,
            self.endpoint.as_ref(),
            &task.reference,
            &self.identity,
            &self.applies_to,
        )
        .await?;
        operation.set_description(format!("{} on {}", self.name, self.endpoint.endpoint));
        self.endpoint.drive(task.reference.clone(), self.script.clone());

        let session: Arc<dyn RemoteSession> = self.endpoint.clone();
        RemoteTaskPoller::new(session, task.reference)
            .with_interval(self.poll_interval)
            .run(operation)
            .await
    }

    async fn prepare_for_restart(&self, operation: &Operation) {
        let Some(task) = operation.related_task() else {
            return;
        };
        if let Err(err) = scrub_remote_task(self.endpoint.as_ref(), &task).await {
            warn!(task = %task, error = %err, "failed to scrub ownership tags");
        }
    }
}
