//! The operation registry.
//!
//! Every non-suppressed operation in the process is registered here exactly
//! once. The registry assigns the correlation id, keeps an [`OperationRecord`]
//! mirrored from the operation's change notifications, and fans its own
//! changes out on a broadcast channel. Records hold only weak references, so
//! history never keeps an operation alive.

use crate::record::OperationRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use xenops_core::{
    Clock, CorrelationId, EndpointId, IdGenerator, OperationId, RecordId, TaskRef,
};
use xenops_operation::{ListenerId, Operation, OperationEvent, OperationField, OperationSnapshot};

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Capacity of the change broadcast channel
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    /// Set the broadcast capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Change to the record table.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A record was created
    RecordAdded(OperationRecord),
    /// A record mirrored a change of its operation
    RecordUpdated(OperationRecord),
    /// A record was evicted
    RecordRemoved(OperationRecord),
    /// A new operation entered the registry; drives "new operation" UI cues
    NewOperation(OperationRecord),
}

#[derive(Default)]
struct RegistryState {
    records: Vec<OperationRecord>,
    by_correlation: HashMap<CorrelationId, RecordId>,
    by_operation: HashMap<OperationId, (RecordId, Option<ListenerId>)>,
}

impl RegistryState {
    fn position(&self, id: RecordId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    fn take(&mut self, index: usize) -> (OperationRecord, Option<ListenerId>) {
        let record = self.records.remove(index);
        if let Some(correlation) = &record.correlation_id {
            if self.by_correlation.get(correlation) == Some(&record.id) {
                self.by_correlation.remove(correlation);
            }
        }
        let listener = match self.by_operation.get(&record.operation_id) {
            Some((rid, listener)) if *rid == record.id => {
                let listener = *listener;
                self.by_operation.remove(&record.operation_id);
                listener
            }
            _ => None,
        };
        (record, listener)
    }
}

/// Process-wide table of operation records.
pub struct OperationRegistry {
    state: Arc<Mutex<RegistryState>>,
    events: broadcast::Sender<RegistryEvent>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl OperationRegistry {
    /// Create a registry with the default configuration.
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self::with_config(clock, ids, RegistryConfig::default())
    }

    /// Create a registry.
    pub fn with_config(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            events,
            clock,
            ids,
        }
    }

    /// Subscribe to record changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Start tracking `operation`.
    ///
    /// Suppressed operations are never recorded and yield `None`. Registering
    /// an operation that is already tracked changes nothing and yields the
    /// existing record id.
    pub fn register(&self, operation: &Operation) -> Option<RecordId> {
        if operation.suppress_from_history() {
            debug!(operation = %operation.id(), "suppressed from history; not recorded");
            return None;
        }
        if let Some((existing, _)) = self.state.lock().by_operation.get(&operation.id()) {
            return Some(*existing);
        }

        if operation.correlation_id().is_none() {
            operation.assign_correlation_id(self.ids.next_correlation_id());
        }

        let snapshot = operation.snapshot();
        let record = OperationRecord::new(operation, &snapshot, self.clock.now());
        let record_id = record.id;
        {
            let mut state = self.state.lock();
            if let Some((existing, _)) = state.by_operation.get(&operation.id()) {
                return Some(*existing);
            }
            if let Some(correlation) = &record.correlation_id {
                if let Some(previous) = state.by_correlation.insert(correlation.clone(), record_id) {
                    warn!(correlation = %correlation, previous = %previous, "correlation id reused by a new record");
                }
            }
            state.by_operation.insert(operation.id(), (record_id, None));
            state.records.push(record);
        }

        let listener = operation.subscribe(self.mirror_listener(record_id));

        // Changes that raced the subscription are picked up here; the version
        // check keeps the record monotonic.
        let added = {
            let mut state = self.state.lock();
            if let Some(entry) = state.by_operation.get_mut(&operation.id()) {
                entry.1 = Some(listener);
            }
            let now = self.clock.now();
            let snapshot = operation.snapshot();
            state.position(record_id).map(|index| {
                state.records[index].mirror(&snapshot, now);
                state.records[index].clone()
            })
        };

        if let Some(record) = added {
            debug!(record = %record_id, title = %record.title, "operation registered");
            let _ = self.events.send(RegistryEvent::RecordAdded(record.clone()));
            let _ = self.events.send(RegistryEvent::NewOperation(record));
        }
        Some(record_id)
    }

    fn mirror_listener(&self, record_id: RecordId) -> impl Fn(&OperationEvent) + Send + Sync + 'static {
        let state: Weak<Mutex<RegistryState>> = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let clock = self.clock.clone();
        move |event| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let updated = match event {
                OperationEvent::Changed {
                    field: OperationField::SuppressFromHistory,
                    snapshot,
                } if snapshot.suppress_from_history => {
                    let taken = {
                        let mut state = state.lock();
                        state.position(record_id).map(|index| state.take(index))
                    };
                    if let Some((record, listener)) = taken {
                        if let (Some(listener), Some(operation)) = (listener, record.operation()) {
                            operation.unsubscribe(listener);
                        }
                        debug!(record = %record.id, "operation suppressed from history; record removed");
                        let _ = events.send(RegistryEvent::RecordRemoved(record));
                    }
                    return;
                }
                OperationEvent::Changed { snapshot, .. } => {
                    mirror_into(&state, record_id, snapshot, clock.now())
                }
                OperationEvent::Dropped { id } => {
                    let mut state = state.lock();
                    state.by_operation.remove(id);
                    state.position(record_id).map(|index| {
                        state.records[index].detach();
                        state.records[index].clone()
                    })
                }
            };
            if let Some(record) = updated {
                let _ = events.send(RegistryEvent::RecordUpdated(record));
            }
        }
    }

    /// All records, in registration order.
    pub fn records(&self) -> Vec<OperationRecord> {
        self.state.lock().records.clone()
    }

    /// Look up a record by id.
    pub fn record(&self, id: RecordId) -> Option<OperationRecord> {
        let state = self.state.lock();
        state.position(id).map(|index| state.records[index].clone())
    }

    /// Look up a record by correlation id.
    pub fn find_by_correlation(&self, correlation: &CorrelationId) -> Option<OperationRecord> {
        let state = self.state.lock();
        let id = state.by_correlation.get(correlation)?;
        state.position(*id).map(|index| state.records[index].clone())
    }

    /// Look up the newest record bound to `task` on `endpoint`.
    pub fn find_by_task(&self, endpoint: &EndpointId, task: &TaskRef) -> Option<OperationRecord> {
        self.state
            .lock()
            .records
            .iter()
            .rev()
            .find(|r| r.endpoint.as_ref() == Some(endpoint) && r.related_task.as_ref() == Some(task))
            .cloned()
    }

    /// Whether `operation` currently has a record.
    pub fn is_tracked(&self, operation: &Operation) -> bool {
        self.state.lock().by_operation.contains_key(&operation.id())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether there are no records.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Evict one record. The operation itself is left untouched.
    pub fn remove_record(&self, id: RecordId) -> Option<OperationRecord> {
        let (record, listener) = {
            let mut state = self.state.lock();
            let index = state.position(id)?;
            state.take(index)
        };
        self.release(&record, listener);
        let _ = self.events.send(RegistryEvent::RecordRemoved(record.clone()));
        Some(record)
    }

    /// Evict every record matching `predicate`. Returns the number evicted.
    pub fn remove_records<P>(&self, predicate: P) -> usize
    where
        P: Fn(&OperationRecord) -> bool,
    {
        let removed = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            let mut index = 0;
            while index < state.records.len() {
                if predicate(&state.records[index]) {
                    removed.push(state.take(index));
                } else {
                    index += 1;
                }
            }
            removed
        };
        let count = removed.len();
        for (record, listener) in removed {
            self.release(&record, listener);
            let _ = self.events.send(RegistryEvent::RecordRemoved(record));
        }
        count
    }

    /// Evict every record whose operation reached a terminal state.
    pub fn remove_finished(&self) -> usize {
        self.remove_records(|r| r.state.is_terminal())
    }

    fn release(&self, record: &OperationRecord, listener: Option<ListenerId>) {
        if let (Some(listener), Some(operation)) = (listener, record.operation()) {
            operation.unsubscribe(listener);
        }
        debug!(record = %record.id, "record removed");
    }

    /// Give every live tracked operation the chance to remove ownership tags
    /// from its remote work before the process exits. Returns how many
    /// operations were visited.
    pub async fn prepare_all_for_restart(&self) -> usize {
        let operations: Vec<Operation> = self
            .state
            .lock()
            .records
            .iter()
            .filter_map(|r| r.weak_operation().and_then(|w| w.upgrade()))
            .collect();
        for operation in &operations {
            operation.prepare_for_restart().await;
        }
        debug!(count = operations.len(), "operations prepared for restart");
        operations.len()
    }
}

fn mirror_into(
    state: &Mutex<RegistryState>,
    record_id: RecordId,
    snapshot: &OperationSnapshot,
    now: xenops_core::Time,
) -> Option<OperationRecord> {
    let mut state = state.lock();
    let index = state.position(record_id)?;
    let record = &mut state.records[index];
    let previous = record.correlation_id.clone();
    if !record.mirror(snapshot, now) {
        return None;
    }
    let updated = record.clone();
    if updated.correlation_id != previous {
        if let Some(correlation) = &updated.correlation_id {
            state.by_correlation.insert(correlation.clone(), record_id);
        }
    }
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordOutcome;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xenops_core::{ManualClock, OperationError, OperationState, UlidGenerator};
    use xenops_operation::OperationBody;

    fn registry() -> (OperationRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        (OperationRegistry::new(clock.clone(), Arc::new(UlidGenerator)), clock)
    }

    fn idle(title: &str) -> Operation {
        Operation::from_fn(title, |_op| async { Ok(()) })
    }

    #[test]
    fn register_assigns_correlation_and_announces() {
        let (registry, _) = registry();
        let mut rx = registry.subscribe();
        let op = idle("Start VM");

        let id = registry.register(&op).unwrap();
        let correlation = op.correlation_id().unwrap();
        assert!(correlation.as_str().starts_with("op_"));

        let record = registry.find_by_correlation(&correlation).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.title, "Start VM");
        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::RecordAdded(r) if r.id == id));
        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::NewOperation(r) if r.id == id));
    }

    #[test]
    fn suppressed_operations_are_never_recorded() {
        let (registry, _) = registry();
        let op = Operation::builder("child")
            .suppress_from_history(true)
            .build(xenops_operation::FnBody::new(|_op| async { Ok(()) }));
        assert!(registry.register(&op).is_none());
        assert!(registry.is_empty());
        assert!(op.correlation_id().is_none());
    }

    #[test]
    fn registering_twice_is_a_no_op() {
        let (registry, _) = registry();
        let op = idle("twice");
        let first = registry.register(&op);
        let correlation = op.correlation_id();
        assert_eq!(registry.register(&op), first);
        assert_eq!(op.correlation_id(), correlation);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn record_mirrors_changes_and_timestamps() {
        let (registry, clock) = registry();
        let op = idle("mirror");
        let id = registry.register(&op).unwrap();
        let mut rx = registry.subscribe();

        clock.advance(Duration::seconds(1));
        op.set_state(OperationState::Running);
        op.set_progress(40);
        op.set_description("copying disks");
        clock.advance(Duration::seconds(9));
        op.complete();

        let record = registry.record(id).unwrap();
        assert_eq!(record.description, "copying disks");
        assert_eq!(record.percent_complete, 100);
        assert_eq!(record.outcome(), RecordOutcome::Succeeded);
        assert_eq!(record.elapsed(), Some(Duration::seconds(9)));
        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::RecordUpdated(_)));
    }

    #[test]
    fn cancelled_is_presented_distinctly() {
        let (registry, _) = registry();
        let op = idle("cancel me");
        let id = registry.register(&op).unwrap();
        op.cancel();
        let record = registry.record(id).unwrap();
        assert_eq!(record.state, OperationState::Cancelled);
        assert_eq!(record.outcome(), RecordOutcome::Cancelled);
        assert!(record.error.is_none());
    }

    #[test]
    fn dropped_operation_leaves_orphaned_record() {
        let (registry, _) = registry();
        let op = idle("short lived");
        let id = registry.register(&op).unwrap();
        op.set_error("boom", vec![]);
        drop(op);

        let record = registry.record(id).unwrap();
        assert!(record.is_orphaned());
        assert!(record.operation().is_none());
        assert!(matches!(record.outcome(), RecordOutcome::Failed(Some(f)) if f.message == "boom"));
    }

    #[test]
    fn removal_stops_mirroring_and_allows_reregistration() {
        let (registry, _) = registry();
        let op = idle("evict");
        let id = registry.register(&op).unwrap();
        let correlation = op.correlation_id().unwrap();

        let removed = registry.remove_record(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.find_by_correlation(&correlation).is_none());
        assert!(!registry.is_tracked(&op));

        op.set_progress(10);
        assert!(registry.is_empty());

        let again = registry.register(&op).unwrap();
        assert_ne!(again, id);
        assert_eq!(op.correlation_id(), Some(correlation));
    }

    #[test]
    fn suppressing_a_tracked_operation_drops_its_record() {
        let (registry, _) = registry();
        let mut rx = registry.subscribe();
        let op = idle("becomes a batch child");
        let id = registry.register(&op).unwrap();
        let correlation = op.correlation_id().unwrap();

        assert!(op.set_suppress_from_history(true));
        assert!(registry.is_empty());
        assert!(!registry.is_tracked(&op));
        assert!(registry.find_by_correlation(&correlation).is_none());

        let removed = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                RegistryEvent::RecordRemoved(r) => Some(r.id),
                _ => None,
            });
        assert_eq!(removed, Some(id));

        // Later changes no longer reach the registry.
        op.set_progress(50);
        assert!(registry.is_empty());
        assert!(registry.register(&op).is_none());
    }

    #[test]
    fn remove_finished_keeps_running_records() {
        let (registry, _) = registry();
        let done = idle("done");
        let failed = idle("failed");
        let running = idle("running");
        for op in [&done, &failed, &running] {
            registry.register(op);
        }
        done.set_state(OperationState::Running);
        done.complete();
        failed.set_error("nope", vec![]);
        running.set_state(OperationState::Running);

        assert_eq!(registry.remove_finished(), 2);
        let records = registry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "running");
    }

    #[test]
    fn find_by_task_matches_endpoint() {
        let (registry, _) = registry();
        let op = Operation::builder("bound")
            .endpoint(EndpointId::new("pool-a"))
            .related_task(TaskRef::new("OpaqueRef:t1"))
            .build(xenops_operation::FnBody::new(|_op| async { Ok(()) }));
        registry.register(&op);
        assert!(registry
            .find_by_task(&EndpointId::new("pool-a"), &TaskRef::new("OpaqueRef:t1"))
            .is_some());
        assert!(registry
            .find_by_task(&EndpointId::new("pool-b"), &TaskRef::new("OpaqueRef:t1"))
            .is_none());
    }

    struct CountingBody(Arc<AtomicUsize>);

    #[async_trait]
    impl OperationBody for CountingBody {
        async fn run(&self, _operation: &Operation) -> Result<(), OperationError> {
            Ok(())
        }

        async fn prepare_for_restart(&self, _operation: &Operation) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn prepare_all_for_restart_visits_live_operations() {
        let (registry, _) = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let first = Operation::builder("a").build(CountingBody(count.clone()));
        let second = Operation::builder("b").build(CountingBody(count.clone()));
        let gone = Operation::builder("c").build(CountingBody(count.clone()));
        registry.register(&first);
        registry.register(&second);
        registry.register(&gone);
        drop(gone);

        assert_eq!(registry.prepare_all_for_restart().await, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
