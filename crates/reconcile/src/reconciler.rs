//! Classification of remote tasks into ignored, unmatched and matched.
//!
//! Notifications arrive at least once and from several sources, so every
//! entry point is idempotent: delivering the same snapshot again leaves the
//! working sets unchanged. The last processed snapshot of a reference always
//! wins.

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::meddling::MeddlingOperation;
use crate::policy::{OperationCodePolicy, OperationTitles};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xenops_core::{AppIdentity, Clock, EndpointId, RemoteTask, SessionError, SessionProvider, TaskRef, Time};
use xenops_operation::{OperationEvent, OperationField, WeakOperation};
use xenops_registry::OperationRegistry;

/// Why a task is not watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwantedReason {
    /// This process already has an operation for it
    OwnedByThisProcess,
    /// Only top-level tasks are watched
    Subtask,
    /// The operation code is not recognized
    UnrecognizedOperation,
}

/// Result of categorizing one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    /// Never watched
    Unwanted(UnwantedReason),
    /// Not watched yet; look again later
    Unmatched,
    /// Should be watched now
    Suitable,
}

/// Where a task reference currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Not tracked
    Ignored,
    /// Waiting to become suitable
    Unmatched,
    /// Watched by a meddling operation
    Matched,
}

/// Reconciler notifications.
#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    /// A meddling operation was created and registered
    MeddlingOperationCreated {
        /// Endpoint of the task
        endpoint: EndpointId,
        /// The watched task
        task: TaskRef,
        /// The operation
        operation: WeakOperation,
        /// Whether this installation created the task
        ours: bool,
    },
    /// A meddling operation left the matched set
    MeddlingOperationEvicted {
        /// Endpoint of the task
        endpoint: EndpointId,
        /// The watched task
        task: TaskRef,
    },
}

/// Outcome of a full enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RehydrateSummary {
    /// Tasks enumerated
    pub enumerated: usize,
    /// Tasks now matched
    pub matched: usize,
    /// Tasks left unmatched
    pub unmatched: usize,
    /// Tasks ignored
    pub ignored: usize,
    /// Records skipped: malformed, or unclassifiable at the time
    pub skipped: usize,
    /// Tracked references missing from the enumeration
    pub removed: usize,
}

type TaskKey = (EndpointId, TaskRef);

#[derive(Default)]
struct WorkingSets {
    unmatched: HashMap<TaskKey, RemoteTask>,
    matched: HashMap<TaskKey, MeddlingOperation>,
    // Terminal tasks already reported, so redelivery does not create a second
    // tracker. Keyed to the time they finished; pruned by the sweep.
    finished: HashMap<TaskKey, Time>,
}

impl WorkingSets {
    fn classification(&self, key: &TaskKey) -> Classification {
        if self.matched.contains_key(key) {
            Classification::Matched
        } else if self.unmatched.contains_key(key) {
            Classification::Unmatched
        } else {
            Classification::Ignored
        }
    }

    fn tracked_refs(&self, endpoint: &EndpointId) -> HashSet<TaskRef> {
        self.unmatched
            .keys()
            .chain(self.matched.keys())
            .chain(self.finished.keys())
            .filter(|(e, _)| e == endpoint)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

/// State shared with the completion listeners of meddling operations.
struct Shared {
    sets: Mutex<WorkingSets>,
    // Trackers that reached a terminal state while the sets were locked.
    evictions: Mutex<Vec<TaskKey>>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ReconcilerEvent>,
}

impl Shared {
    /// Lock the working sets, settling queued evictions first.
    fn lock_sets(&self) -> MutexGuard<'_, WorkingSets> {
        let mut sets = self.sets.lock();
        self.drain_evictions(&mut sets);
        sets
    }

    fn drain_evictions(&self, sets: &mut WorkingSets) {
        let queued = std::mem::take(&mut *self.evictions.lock());
        for key in queued {
            let terminal = sets
                .matched
                .get(&key)
                .map_or(false, |m| m.operation().state().is_terminal());
            if terminal {
                sets.matched.remove(&key);
                self.finish(sets, key);
            }
        }
    }

    fn finish(&self, sets: &mut WorkingSets, key: TaskKey) {
        sets.finished.insert(key.clone(), self.clock.now());
        self.evicted(key);
    }

    fn evicted(&self, (endpoint, task): TaskKey) {
        debug!(endpoint = %endpoint, task = %task, "meddling operation evicted");
        let _ = self
            .events
            .send(ReconcilerEvent::MeddlingOperationEvicted { endpoint, task });
    }
}

/// The reconciliation engine.
pub struct Reconciler {
    shared: Arc<Shared>,
    registry: Arc<OperationRegistry>,
    sessions: Arc<dyn SessionProvider>,
    identity: AppIdentity,
    policy: Arc<dyn OperationCodePolicy>,
    titles: Arc<OperationTitles>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler. The operation-code policy comes from `config`.
    pub fn new(
        registry: Arc<OperationRegistry>,
        sessions: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
        identity: AppIdentity,
        config: ReconcilerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                sets: Mutex::new(WorkingSets::default()),
                evictions: Mutex::new(Vec::new()),
                clock,
                events,
            }),
            registry,
            sessions,
            identity,
            policy: config.policy(),
            titles: Arc::new(OperationTitles::default()),
            config,
        }
    }

    /// Replace the operation-code policy.
    pub fn with_policy(mut self, policy: Arc<dyn OperationCodePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the title table.
    pub fn with_titles(mut self, titles: OperationTitles) -> Self {
        self.titles = Arc::new(titles);
        self
    }

    /// Subscribe to reconciler events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.shared.events.subscribe()
    }

    /// Identity used to recognise this console's tasks.
    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    /// Categorize one snapshot at the current time.
    pub fn categorize(&self, task: &RemoteTask) -> TaskCategory {
        if self.identity.created_by_this_process(task) {
            return TaskCategory::Unwanted(UnwantedReason::OwnedByThisProcess);
        }
        if !task.is_top_level() {
            return TaskCategory::Unwanted(UnwantedReason::Subtask);
        }
        if !self.policy.is_recognized(task.operation_code()) {
            return TaskCategory::Unwanted(UnwantedReason::UnrecognizedOperation);
        }
        if task.applies_to().is_some() {
            return TaskCategory::Suitable;
        }
        let age = self.shared.clock.now() + self.config.clock_offset() - task.created;
        if age >= self.config.grace_window() {
            TaskCategory::Suitable
        } else {
            TaskCategory::Unmatched
        }
    }

    /// Current classification of a task reference.
    pub fn classification(&self, endpoint: &EndpointId, task: &TaskRef) -> Classification {
        self.shared
            .lock_sets()
            .classification(&(endpoint.clone(), task.clone()))
    }

    /// The meddling operation watching a task, if any.
    pub fn matched_operation(&self, endpoint: &EndpointId, task: &TaskRef) -> Option<MeddlingOperation> {
        self.shared
            .lock_sets()
            .matched
            .get(&(endpoint.clone(), task.clone()))
            .cloned()
    }

    /// Number of matched tasks.
    pub fn matched_count(&self) -> usize {
        self.shared.lock_sets().matched.len()
    }

    /// Number of unmatched tasks.
    pub fn unmatched_count(&self) -> usize {
        self.shared.lock_sets().unmatched.len()
    }

    /// Number of finished tasks still remembered against redelivery.
    pub fn finished_count(&self) -> usize {
        self.shared.lock_sets().finished.len()
    }

    /// A task appeared on `endpoint`.
    pub fn on_task_added(&self, endpoint: &EndpointId, task: &RemoteTask) -> ReconcileResult<Classification> {
        self.process(endpoint, task)
    }

    /// A task on `endpoint` changed.
    pub fn on_task_updated(&self, endpoint: &EndpointId, task: &RemoteTask) -> ReconcileResult<Classification> {
        self.process(endpoint, task)
    }

    /// A task record was deleted from `endpoint`.
    pub fn on_task_removed(&self, endpoint: &EndpointId, task: &TaskRef) {
        let mut sets = self.shared.lock_sets();
        self.remove_locked(&mut sets, (endpoint.clone(), task.clone()));
    }

    fn process(&self, endpoint: &EndpointId, task: &RemoteTask) -> ReconcileResult<Classification> {
        if task.is_malformed() {
            warn!(endpoint = %endpoint, task = %task.reference, "skipping malformed task record");
            return Err(ReconcileError::MalformedTask(task.reference.clone()));
        }
        let mut sets = self.shared.lock_sets();
        self.process_locked(&mut sets, endpoint, task)
    }

    fn process_locked(
        &self,
        sets: &mut WorkingSets,
        endpoint: &EndpointId,
        task: &RemoteTask,
    ) -> ReconcileResult<Classification> {
        let key = (endpoint.clone(), task.reference.clone());

        if sets.finished.contains_key(&key) {
            return Ok(Classification::Ignored);
        }

        if let Some(meddling) = sets.matched.get(&key) {
            if !meddling.apply(task) {
                return Ok(Classification::Matched);
            }
            sets.matched.remove(&key);
            self.shared.finish(sets, key);
            return Ok(Classification::Ignored);
        }

        match self.categorize(task) {
            TaskCategory::Unwanted(reason) => {
                if sets.unmatched.remove(&key).is_some() {
                    debug!(endpoint = %endpoint, task = %task.reference, ?reason, "unmatched task became unwanted");
                }
                Ok(Classification::Ignored)
            }
            TaskCategory::Unmatched => {
                sets.unmatched.insert(key, task.clone());
                Ok(Classification::Unmatched)
            }
            TaskCategory::Suitable => {
                let was_unmatched = sets.unmatched.remove(&key).is_some();
                if task.status.is_terminal() && !was_unmatched {
                    // Finished before we ever saw it running; nothing to watch.
                    sets.finished.insert(key, self.shared.clock.now());
                    return Ok(Classification::Ignored);
                }

                let Some(session) = self.sessions.session(endpoint) else {
                    warn!(endpoint = %endpoint, task = %task.reference, "no session; task dropped until next enumeration");
                    return Err(ReconcileError::NoSession(endpoint.clone()));
                };

                let ours = self.identity.created_by_this_installation(task);
                let meddling = MeddlingOperation::new(
                    session,
                    task,
                    ours,
                    self.titles.clone(),
                    self.config.poll_interval(),
                );
                self.registry.register(meddling.operation());
                self.evict_on_completion(&meddling, key.clone());
                info!(
                    endpoint = %endpoint,
                    task = %task.reference,
                    title = %meddling.operation().title(),
                    ours,
                    "watching remote task"
                );
                let _ = self.shared.events.send(ReconcilerEvent::MeddlingOperationCreated {
                    endpoint: endpoint.clone(),
                    task: task.reference.clone(),
                    operation: meddling.operation().downgrade(),
                    ours,
                });

                if meddling.apply(task) {
                    self.shared.finish(sets, key);
                    return Ok(Classification::Ignored);
                }

                if self.config.poll_matched {
                    if tokio::runtime::Handle::try_current().is_ok() {
                        meddling.operation().start();
                    } else {
                        debug!(task = %task.reference, "no runtime; relying on notifications only");
                    }
                }
                sets.matched.insert(key, meddling);
                Ok(Classification::Matched)
            }
        }
    }

    /// Evict the tracker as soon as its own polling finishes it.
    fn evict_on_completion(&self, meddling: &MeddlingOperation, key: TaskKey) {
        let shared = Arc::downgrade(&self.shared);
        meddling.operation().subscribe(move |event| {
            let OperationEvent::Changed {
                field: OperationField::State,
                snapshot,
            } = event
            else {
                return;
            };
            if !snapshot.state.is_terminal() {
                return;
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.evictions.lock().push(key.clone());
            // Whoever holds the sets drains the queue on its next lock.
            if let Some(mut sets) = shared.sets.try_lock() {
                shared.drain_evictions(&mut sets);
            };
        });
    }

    fn remove_locked(&self, sets: &mut WorkingSets, key: TaskKey) {
        sets.finished.remove(&key);
        if let Some(meddling) = sets.matched.remove(&key) {
            meddling.mark_removed();
            self.shared.evicted(key);
        } else if sets.unmatched.remove(&key).is_some() {
            debug!(endpoint = %key.0, task = %key.1, "unmatched task removed");
        }
    }

    /// Classify every task of `endpoint` after a (re)connect.
    ///
    /// References that were tracked before the enumeration started and are
    /// absent from it are handled as removed. A task that cannot be
    /// classified is skipped and picked up by the next enumeration.
    pub async fn rehydrate(&self, endpoint: &EndpointId) -> ReconcileResult<RehydrateSummary> {
        let session = self
            .sessions
            .session(endpoint)
            .ok_or_else(|| ReconcileError::NoSession(endpoint.clone()))?;
        if !session.is_logged_in() {
            return Err(SessionError::NotLoggedIn(endpoint.to_string()).into());
        }
        // Notifications keep arriving while the enumeration is in flight.
        let tracked_before = self.shared.lock_sets().tracked_refs(endpoint);
        let tasks = session.enumerate_tasks().await?;

        let mut ordered: Vec<&RemoteTask> = tasks.values().collect();
        ordered.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.reference.cmp(&b.reference)));

        let mut summary = RehydrateSummary {
            enumerated: ordered.len(),
            ..RehydrateSummary::default()
        };
        for task in ordered {
            match self.process(endpoint, task) {
                Ok(Classification::Matched) => summary.matched += 1,
                Ok(Classification::Unmatched) => summary.unmatched += 1,
                Ok(Classification::Ignored) => summary.ignored += 1,
                Err(ReconcileError::MalformedTask(_)) => summary.skipped += 1,
                Err(err) => {
                    warn!(endpoint = %endpoint, task = %task.reference, error = %err, "rehydration skipped task");
                    summary.skipped += 1;
                }
            }
        }

        let mut sets = self.shared.lock_sets();
        let vanished: Vec<TaskRef> = sets
            .tracked_refs(endpoint)
            .into_iter()
            .filter(|r| tracked_before.contains(r) && !tasks.contains_key(r))
            .collect();
        for task in vanished {
            self.remove_locked(&mut sets, (endpoint.clone(), task));
            summary.removed += 1;
        }
        drop(sets);

        info!(
            endpoint = %endpoint,
            enumerated = summary.enumerated,
            matched = summary.matched,
            unmatched = summary.unmatched,
            ignored = summary.ignored,
            skipped = summary.skipped,
            removed = summary.removed,
            "rehydration finished"
        );
        Ok(summary)
    }

    /// Re-evaluate every unmatched task against the current time. Returns
    /// the number of tasks that left the unmatched set.
    ///
    /// Matched operations that finished through their own polling are
    /// evicted on the way, and finished entries older than the retention
    /// are forgotten.
    pub fn sweep_unmatched(&self) -> usize {
        let mut sets = self.shared.lock_sets();
        let finished: Vec<TaskKey> = sets
            .matched
            .iter()
            .filter(|(_, m)| m.operation().state().is_terminal())
            .map(|(k, _)| k.clone())
            .collect();
        for key in finished {
            sets.matched.remove(&key);
            self.shared.finish(&mut sets, key);
        }

        let remembered = sets.finished.len();
        if let Some(cutoff) = self
            .shared
            .clock
            .now()
            .checked_sub_signed(self.config.finished_retention())
        {
            sets.finished.retain(|_, at| *at > cutoff);
        }
        let pruned = remembered - sets.finished.len();

        let pending: Vec<(TaskKey, RemoteTask)> = sets
            .unmatched
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        let mut promoted = 0;
        for ((endpoint, _), task) in pending {
            match self.process_locked(&mut sets, &endpoint, &task) {
                Ok(Classification::Unmatched) => {}
                Ok(_) => promoted += 1,
                Err(err) => {
                    debug!(endpoint = %endpoint, task = %task.reference, error = %err, "sweep skipped task");
                }
            }
        }
        if promoted > 0 || pruned > 0 {
            debug!(promoted, pruned, "unmatched sweep");
        }
        promoted
    }

    /// Run [`sweep_unmatched`](Self::sweep_unmatched) periodically until
    /// `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        reconciler.sweep_unmatched();
                    }
                }
            }
            debug!("unmatched sweeper stopped");
        })
    }

    /// Drop unmatched and finished bookkeeping for an endpoint that went
    /// away. Matched tasks are kept so that a later rehydration reattaches to
    /// the same operation instead of creating a second tracker.
    pub fn forget_endpoint(&self, endpoint: &EndpointId) -> usize {
        let mut sets = self.shared.lock_sets();
        let before = sets.unmatched.len() + sets.finished.len();
        sets.unmatched.retain(|(e, _), _| e != endpoint);
        sets.finished.retain(|(e, _), _| e != endpoint);
        before - (sets.unmatched.len() + sets.finished.len())
    }
}
