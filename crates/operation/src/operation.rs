//! The Operation state machine.

use crate::body::{FnBody, OperationBody};
use crate::event::{ListenerId, OperationDetail, OperationEvent, OperationField, OperationSnapshot};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xenops_core::{
    CorrelationId, EndpointId, OperationError, OperationFailure, OperationId, OperationState,
    TaskRef,
};

type Listener = Arc<dyn Fn(&OperationEvent) + Send + Sync>;

struct OperationInner {
    id: OperationId,
    data: Mutex<OperationSnapshot>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    launched: AtomicBool,
    token: CancellationToken,
    state_tx: watch::Sender<OperationState>,
    body: Arc<dyn OperationBody>,
}

impl Drop for OperationInner {
    fn drop(&mut self) {
        let listeners = std::mem::take(self.listeners.get_mut());
        let event = OperationEvent::Dropped { id: self.id };
        for (_, listener) in listeners {
            listener(&event);
        }
    }
}

/// A unit of asynchronous work with observable progress.
///
/// Cloning yields another handle to the same operation. The operation is
/// destroyed when the last handle goes away; observers holding a
/// [`WeakOperation`] are told through [`OperationEvent::Dropped`].
///
/// Every setter is a no-op once the operation is terminal, and only notifies
/// listeners when the value actually changed. Listeners run on the mutating
/// thread after the change and before the setter returns.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Operation")
            .field("id", &data.id)
            .field("title", &data.title)
            .field("state", &data.state)
            .field("percent_complete", &data.percent_complete)
            .finish()
    }
}

/// Non-owning handle to an Operation.
#[derive(Clone)]
pub struct WeakOperation {
    id: OperationId,
    inner: Weak<OperationInner>,
}

impl WeakOperation {
    /// Identity of the referenced operation.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Get a strong handle if the operation is still alive.
    pub fn upgrade(&self) -> Option<Operation> {
        self.inner.upgrade().map(|inner| Operation { inner })
    }

    /// Whether the operation has been destroyed.
    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl std::fmt::Debug for WeakOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakOperation")
            .field("id", &self.id)
            .field("alive", &!self.is_dropped())
            .finish()
    }
}

/// Builder for [`Operation`].
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    title: String,
    description: String,
    endpoint: Option<EndpointId>,
    related_task: Option<TaskRef>,
    can_cancel: bool,
    suppress_from_history: bool,
    already_running: bool,
}

impl OperationBuilder {
    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the target endpoint.
    pub fn endpoint(mut self, endpoint: EndpointId) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Bind to an existing remote task.
    pub fn related_task(mut self, task: TaskRef) -> Self {
        self.related_task = Some(task);
        self
    }

    /// Allow or forbid cancellation (allowed by default).
    pub fn can_cancel(mut self, can_cancel: bool) -> Self {
        self.can_cancel = can_cancel;
        self
    }

    /// Keep the operation out of history.
    pub fn suppress_from_history(mut self, suppress: bool) -> Self {
        self.suppress_from_history = suppress;
        self
    }

    /// Construct directly in `Running`, for operations observing work that
    /// already exists.
    pub fn already_running(mut self) -> Self {
        self.already_running = true;
        self
    }

    /// Build the operation around `body`.
    pub fn build(self, body: impl OperationBody + 'static) -> Operation {
        self.build_shared(Arc::new(body))
    }

    /// Build around a body the caller keeps a handle to.
    pub fn build_shared(self, body: Arc<dyn OperationBody>) -> Operation {
        let id = OperationId::new();
        let state = if self.already_running {
            OperationState::Running
        } else {
            OperationState::NotStarted
        };
        let (state_tx, _) = watch::channel(state);
        let data = OperationSnapshot {
            id,
            correlation_id: None,
            title: self.title,
            description: self.description,
            percent_complete: 0,
            state,
            related_task: self.related_task,
            error: None,
            cancel_requested: false,
            can_cancel: self.can_cancel,
            suppress_from_history: self.suppress_from_history,
            endpoint: self.endpoint,
            detail: None,
            version: 0,
        };
        Operation {
            inner: Arc::new(OperationInner {
                id,
                data: Mutex::new(data),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                launched: AtomicBool::new(false),
                token: CancellationToken::new(),
                state_tx,
                body,
            }),
        }
    }
}

enum CancelDecision {
    Terminal,
    NotCancellable,
    Refused,
    AlreadyRequested,
    Requested,
    CancelledBeforeStart,
}

impl Operation {
    /// Start building an operation.
    pub fn builder(title: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            title: title.into(),
            description: String::new(),
            endpoint: None,
            related_task: None,
            can_cancel: true,
            suppress_from_history: false,
            already_running: false,
        }
    }

    /// Shorthand for an operation whose body is an async closure.
    pub fn from_fn<F, Fut>(title: impl Into<String>, f: F) -> Self
    where
        F: Fn(Operation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        Self::builder(title).build(FnBody::new(f))
    }

    // === Accessors ===

    /// Identity.
    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    /// Copy of every observable field.
    pub fn snapshot(&self) -> OperationSnapshot {
        self.inner.data.lock().clone()
    }

    /// Lifecycle state.
    pub fn state(&self) -> OperationState {
        self.inner.data.lock().state
    }

    /// Title.
    pub fn title(&self) -> String {
        self.inner.data.lock().title.clone()
    }

    /// Description.
    pub fn description(&self) -> String {
        self.inner.data.lock().description.clone()
    }

    /// Progress, 0..=100.
    pub fn percent_complete(&self) -> u8 {
        self.inner.data.lock().percent_complete
    }

    /// Failure, when failed.
    pub fn error(&self) -> Option<OperationFailure> {
        self.inner.data.lock().error.clone()
    }

    /// Correlation id, once assigned.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.inner.data.lock().correlation_id.clone()
    }

    /// Remote task this operation is bound to.
    pub fn related_task(&self) -> Option<TaskRef> {
        self.inner.data.lock().related_task.clone()
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.inner.data.lock().endpoint.clone()
    }

    /// Whether cancellation is allowed.
    pub fn can_cancel(&self) -> bool {
        self.inner.data.lock().can_cancel
    }

    /// Whether cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.data.lock().cancel_requested
    }

    /// Whether the operation is kept out of history.
    pub fn suppress_from_history(&self) -> bool {
        self.inner.data.lock().suppress_from_history
    }

    /// Token fired when cancellation is accepted. Bodies check it at their
    /// suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakOperation {
        WeakOperation {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same operation.
    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === Observers ===

    /// Register a listener for change and destruction notifications.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, event: &OperationEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Apply `f` under the data lock; notify if it reports a changed field.
    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut OperationSnapshot) -> Option<OperationField>,
    {
        let (field, snapshot) = {
            let mut data = self.inner.data.lock();
            let Some(field) = f(&mut data) else {
                return false;
            };
            data.version += 1;
            (field, data.clone())
        };
        if field == OperationField::State {
            self.inner.state_tx.send_replace(snapshot.state);
        }
        self.notify(&OperationEvent::Changed { field, snapshot });
        true
    }

    // === Mutators ===

    /// Set the title.
    pub fn set_title(&self, title: impl Into<String>) -> bool {
        let title = title.into();
        self.mutate(|d| {
            if d.state.is_terminal() || d.title == title {
                return None;
            }
            d.title = title;
            Some(OperationField::Title)
        })
    }

    /// Set the description.
    pub fn set_description(&self, description: impl Into<String>) -> bool {
        let description = description.into();
        self.mutate(|d| {
            if d.state.is_terminal() || d.description == description {
                return None;
            }
            d.description = description;
            Some(OperationField::Description)
        })
    }

    /// Set progress; values above 100 are clamped.
    pub fn set_progress(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        self.mutate(|d| {
            if d.state.is_terminal() || d.percent_complete == percent {
                return None;
            }
            d.percent_complete = percent;
            Some(OperationField::Progress)
        })
    }

    /// Set or clear the active child detail.
    pub fn set_detail(&self, detail: Option<OperationDetail>) -> bool {
        self.mutate(|d| {
            if d.state.is_terminal() || d.detail == detail {
                return None;
            }
            d.detail = detail;
            Some(OperationField::Detail)
        })
    }

    /// Bind to a remote task.
    pub fn set_related_task(&self, task: TaskRef) -> bool {
        self.mutate(|d| {
            if d.state.is_terminal() || d.related_task.as_ref() == Some(&task) {
                return None;
            }
            d.related_task = Some(task);
            Some(OperationField::RelatedTask)
        })
    }

    /// Assign the correlation id. Only the first assignment takes effect.
    pub fn assign_correlation_id(&self, id: CorrelationId) -> bool {
        self.mutate(|d| {
            if d.correlation_id.is_some() {
                return None;
            }
            d.correlation_id = Some(id);
            Some(OperationField::CorrelationId)
        })
    }

    /// Keep the operation out of history. A registry already tracking the
    /// operation drops its record when this is switched on.
    pub fn set_suppress_from_history(&self, suppress: bool) -> bool {
        self.mutate(|d| {
            if d.suppress_from_history == suppress {
                return None;
            }
            d.suppress_from_history = suppress;
            Some(OperationField::SuppressFromHistory)
        })
    }

    /// Move to `next` if the state machine allows it.
    pub fn set_state(&self, next: OperationState) -> bool {
        let id = self.inner.id;
        self.mutate(|d| {
            if d.state.is_terminal() {
                debug!(operation = %id, from = %d.state, to = %next, "ignoring transition out of terminal state");
                return None;
            }
            if !d.state.can_transition_to(&next) {
                warn!(operation = %id, from = %d.state, to = %next, "rejected state transition");
                return None;
            }
            d.state = next;
            Some(OperationField::State)
        })
    }

    /// Move to `Completed` with full progress.
    pub fn complete(&self) -> bool {
        self.mutate(|d| {
            if !d.state.can_transition_to(&OperationState::Completed) {
                return None;
            }
            d.state = OperationState::Completed;
            d.percent_complete = 100;
            Some(OperationField::State)
        })
    }

    /// Record a failure and move to `Failed`. Freezes the operation.
    pub fn set_error(&self, message: impl Into<String>, details: Vec<String>) -> bool {
        let failure = OperationFailure::new(message).with_details(details);
        self.mutate(|d| {
            if !d.state.can_transition_to(&OperationState::Failed) {
                return None;
            }
            d.state = OperationState::Failed;
            d.error = Some(failure);
            Some(OperationField::State)
        })
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `true` if a cancellation request is in effect after the call.
    /// Cancelling an operation that cannot be cancelled, or that already
    /// finished, is a logged no-op, and so is a request the body cannot act
    /// on yet. An operation that never started moves to `Cancelled` at once.
    pub fn cancel(&self) -> bool {
        let accepted = self.inner.body.accepts_cancel(self);
        let mut decision = CancelDecision::Terminal;
        self.mutate(|d| {
            if d.state.is_terminal() {
                decision = CancelDecision::Terminal;
                return None;
            }
            if !d.can_cancel {
                decision = CancelDecision::NotCancellable;
                return None;
            }
            if !accepted {
                decision = CancelDecision::Refused;
                return None;
            }
            if d.cancel_requested {
                decision = CancelDecision::AlreadyRequested;
                return None;
            }
            d.cancel_requested = true;
            if d.state == OperationState::NotStarted {
                d.state = OperationState::Cancelled;
                decision = CancelDecision::CancelledBeforeStart;
                Some(OperationField::State)
            } else {
                decision = CancelDecision::Requested;
                Some(OperationField::CancelRequested)
            }
        });

        match decision {
            CancelDecision::Terminal => {
                debug!(operation = %self.id(), "cancel ignored: operation already finished");
                false
            }
            CancelDecision::NotCancellable => {
                info!(operation = %self.id(), "cancel ignored: operation cannot be cancelled");
                false
            }
            CancelDecision::Refused => {
                warn!(operation = %self.id(), "cancel refused: the work cannot be cancelled right now");
                false
            }
            CancelDecision::AlreadyRequested => true,
            CancelDecision::Requested | CancelDecision::CancelledBeforeStart => {
                info!(operation = %self.id(), "cancellation requested");
                self.inner.token.cancel();
                self.inner.body.on_cancel(self);
                true
            }
        }
    }

    // === Execution ===

    /// Run the operation on the tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let operation = self.clone();
        tokio::spawn(async move { operation.run_inline().await })
    }

    /// Run the operation on the caller's task.
    ///
    /// A second call, or a call on an operation that is already terminal, is
    /// a no-op.
    pub async fn run_inline(&self) {
        if self.inner.launched.swap(true, Ordering::AcqRel) {
            debug!(operation = %self.id(), "operation already launched");
            return;
        }

        self.mutate(|d| {
            if d.state != OperationState::NotStarted {
                return None;
            }
            d.state = OperationState::Running;
            Some(OperationField::State)
        });
        if self.state() != OperationState::Running {
            debug!(operation = %self.id(), state = %self.state(), "operation not runnable");
            return;
        }

        info!(operation = %self.id(), title = %self.title(), "operation started");
        let body = self.inner.body.clone();
        let outcome = match AssertUnwindSafe(body.run(self)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(OperationError::failed("operation panicked")),
        };
        self.finish(outcome);
    }

    fn finish(&self, outcome: Result<(), OperationError>) {
        match outcome {
            Ok(()) => {
                self.complete();
            }
            Err(OperationError::Cancelled) => {
                self.set_state(OperationState::Cancelled);
            }
            Err(err) => {
                if let Some(failure) = err.to_failure() {
                    self.set_error(failure.message, failure.details);
                }
            }
        }
        let snapshot = self.snapshot();
        match &snapshot.error {
            Some(error) => warn!(operation = %snapshot.id, error = %error, "operation failed"),
            None => info!(operation = %snapshot.id, state = %snapshot.state, "operation finished"),
        }
    }

    /// Wait until the operation reaches a terminal state.
    pub async fn wait(&self) -> OperationState {
        let mut rx = self.inner.state_tx.subscribe();
        // Bound to a local: the watch::Ref in the scrutinee borrows `rx`.
        let state = match rx.wait_for(OperationState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Give the body a chance to scrub remote ownership markers.
    pub async fn prepare_for_restart(&self) {
        if self.state().is_terminal() {
            return;
        }
        let body = self.inner.body.clone();
        body.prepare_for_restart(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn idle() -> Operation {
        Operation::from_fn("idle", |_op| async { Ok(()) })
    }

    #[test]
    fn terminal_state_is_sticky() {
        let op = idle();
        assert!(op.set_state(OperationState::Running));
        assert!(op.set_error("boom", vec!["detail".to_string()]));
        assert_eq!(op.state(), OperationState::Failed);

        assert!(!op.set_state(OperationState::Running));
        assert!(!op.set_state(OperationState::Completed));
        assert!(!op.complete());
        assert!(!op.set_progress(42));
        assert!(!op.set_title("changed"));
        assert!(!op.set_description("changed"));
        assert!(!op.set_error("again", vec![]));
        assert!(!op.cancel());

        let snapshot = op.snapshot();
        assert_eq!(snapshot.state, OperationState::Failed);
        assert_eq!(snapshot.title, "idle");
        assert_eq!(snapshot.error.unwrap().message, "boom");
    }

    #[test]
    fn not_started_cannot_complete_directly() {
        let op = idle();
        assert!(!op.set_state(OperationState::Completed));
        assert_eq!(op.state(), OperationState::NotStarted);
    }

    #[test]
    fn setters_notify_only_on_change() {
        let op = idle();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        op.subscribe(move |event| {
            if matches!(event, OperationEvent::Changed { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(op.set_progress(10));
        assert!(!op.set_progress(10));
        assert!(op.set_description("working"));
        assert!(!op.set_description("working"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn progress_is_clamped() {
        let op = idle();
        op.set_progress(250);
        assert_eq!(op.percent_complete(), 100);
    }

    #[test]
    fn correlation_id_assigned_once() {
        let op = idle();
        let first = CorrelationId("op_first".to_string());
        assert!(op.assign_correlation_id(first.clone()));
        assert!(!op.assign_correlation_id(CorrelationId("op_second".to_string())));
        assert_eq!(op.correlation_id(), Some(first));
    }

    #[test]
    fn cancel_before_start_moves_to_cancelled() {
        let op = idle();
        assert!(op.cancel());
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(op.cancellation_token().is_cancelled());
    }

    #[test]
    fn cancel_without_permission_is_noop() {
        let op = Operation::builder("locked")
            .can_cancel(false)
            .build(FnBody::new(|_op| async { Ok(()) }));
        op.set_state(OperationState::Running);
        assert!(!op.cancel());
        assert!(!op.is_cancel_requested());
        assert!(!op.cancellation_token().is_cancelled());
        assert_eq!(op.state(), OperationState::Running);
    }

    struct Gated {
        open: AtomicBool,
        cancels: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OperationBody for Gated {
        async fn run(&self, _operation: &Operation) -> Result<(), OperationError> {
            Ok(())
        }

        fn accepts_cancel(&self, _operation: &Operation) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn on_cancel(&self, _operation: &Operation) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_refused_by_body_leaves_operation_untouched() {
        let body = Arc::new(Gated {
            open: AtomicBool::new(false),
            cancels: AtomicUsize::new(0),
        });
        let op = Operation::builder("remote").build_shared(body.clone());
        op.set_state(OperationState::Running);

        assert!(!op.cancel());
        assert!(!op.is_cancel_requested());
        assert!(!op.cancellation_token().is_cancelled());
        assert_eq!(body.cancels.load(Ordering::SeqCst), 0);

        body.open.store(true, Ordering::SeqCst);
        assert!(op.cancel());
        assert!(op.is_cancel_requested());
        assert_eq!(body.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_last_handle_notifies() {
        let op = idle();
        let id = op.id();
        let dropped = Arc::new(Mutex::new(None));
        let sink = dropped.clone();
        op.subscribe(move |event| {
            if let OperationEvent::Dropped { id } = event {
                *sink.lock() = Some(*id);
            }
        });
        let weak = op.downgrade();
        drop(op);
        assert!(weak.is_dropped());
        assert_eq!(*dropped.lock(), Some(id));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let op = idle();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let id = op.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(op.unsubscribe(id));
        assert!(!op.unsubscribe(id));
        op.set_progress(5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_body_completes() {
        let op = Operation::from_fn("work", |op| async move {
            op.set_progress(50);
            Ok(())
        });
        op.run_inline().await;
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(op.percent_complete(), 100);
    }

    #[tokio::test]
    async fn failing_body_records_error() {
        let op = Operation::from_fn("work", |_op| async {
            Err(OperationError::Failed {
                message: "disk full".to_string(),
                details: vec!["sr0".to_string()],
            })
        });
        op.start().await.unwrap();
        assert_eq!(op.state(), OperationState::Failed);
        let error = op.error().unwrap();
        assert_eq!(error.message, "disk full");
        assert_eq!(error.details, vec!["sr0".to_string()]);
    }

    #[tokio::test]
    async fn panicking_body_fails() {
        let op = Operation::from_fn("work", |_op| async {
            let broken = true;
            if broken {
                panic!("bug");
            }
            Ok(())
        });
        op.run_inline().await;
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[tokio::test]
    async fn cooperative_cancellation_while_running() {
        let op = Operation::from_fn("wait", |op| async move {
            op.cancellation_token().cancelled().await;
            Err(OperationError::Cancelled)
        });
        let handle = op.start();
        tokio::task::yield_now().await;
        assert!(op.cancel());
        handle.await.unwrap();
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(op.error().is_none());
    }

    #[tokio::test]
    async fn second_run_is_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let op = Operation::from_fn("once", move |_op| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        op.run_inline().await;
        op.run_inline().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_running_operation_runs_its_body() {
        let op = Operation::builder("observer")
            .already_running()
            .build(FnBody::new(|_op| async { Ok(()) }));
        assert_eq!(op.state(), OperationState::Running);
        op.run_inline().await;
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[tokio::test]
    async fn wait_returns_terminal_state() {
        let op = idle();
        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait().await })
        };
        op.start();
        assert_eq!(waiter.await.unwrap(), OperationState::Completed);
    }
}
