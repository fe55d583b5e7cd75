//! In-memory session used by the tests of this crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use xenops_core::{EndpointId, RemoteSession, RemoteTask, SessionError, SessionProvider, SessionResult, TaskRef};

pub(crate) struct MockSession {
    endpoint: EndpointId,
    logged_in: AtomicBool,
    pub tasks: Mutex<HashMap<TaskRef, RemoteTask>>,
    pub cancels: Mutex<Vec<TaskRef>>,
}

impl MockSession {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: EndpointId::new(endpoint),
            logged_in: AtomicBool::new(true),
            tasks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn put(&self, task: RemoteTask) {
        self.tasks.lock().insert(task.reference.clone(), task);
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_task(&self, task: &TaskRef) -> SessionResult<Option<RemoteTask>> {
        Ok(self.tasks.lock().get(task).cloned())
    }

    async fn enumerate_tasks(&self) -> SessionResult<HashMap<TaskRef, RemoteTask>> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn(self.endpoint.to_string()));
        }
        Ok(self.tasks.lock().clone())
    }

    async fn cancel_task(&self, task: &TaskRef) -> SessionResult<()> {
        self.cancels.lock().push(task.clone());
        Ok(())
    }

    async fn set_task_metadata(&self, task: &TaskRef, key: &str, value: &str) -> SessionResult<()> {
        let mut tasks = self.tasks.lock();
        let record = tasks
            .get_mut(task)
            .ok_or_else(|| SessionError::TaskNotFound(task.to_string()))?;
        record.other_config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_task_metadata(&self, task: &TaskRef, key: &str) -> SessionResult<()> {
        let mut tasks = self.tasks.lock();
        let record = tasks
            .get_mut(task)
            .ok_or_else(|| SessionError::TaskNotFound(task.to_string()))?;
        record.other_config.remove(key);
        Ok(())
    }
}

/// Session whose enumeration takes its snapshot, then waits for `gate`
/// before returning it.
pub(crate) struct GatedSession {
    pub inner: Arc<MockSession>,
    pub gate: Arc<Notify>,
}

#[async_trait]
impl RemoteSession for GatedSession {
    fn endpoint(&self) -> &EndpointId {
        self.inner.endpoint()
    }

    fn is_logged_in(&self) -> bool {
        self.inner.is_logged_in()
    }

    async fn get_task(&self, task: &TaskRef) -> SessionResult<Option<RemoteTask>> {
        self.inner.get_task(task).await
    }

    async fn enumerate_tasks(&self) -> SessionResult<HashMap<TaskRef, RemoteTask>> {
        let snapshot = self.inner.enumerate_tasks().await?;
        self.gate.notified().await;
        Ok(snapshot)
    }

    async fn cancel_task(&self, task: &TaskRef) -> SessionResult<()> {
        self.inner.cancel_task(task).await
    }

    async fn set_task_metadata(&self, task: &TaskRef, key: &str, value: &str) -> SessionResult<()> {
        self.inner.set_task_metadata(task, key, value).await
    }

    async fn remove_task_metadata(&self, task: &TaskRef, key: &str) -> SessionResult<()> {
        self.inner.remove_task_metadata(task, key).await
    }
}

/// Provider that hands out its session once, as if the connection dropped
/// right after.
pub(crate) struct OneShotProvider {
    pub session: Arc<MockSession>,
    pub calls: AtomicUsize,
}

impl SessionProvider for OneShotProvider {
    fn session(&self, endpoint: &EndpointId) -> Option<Arc<dyn RemoteSession>> {
        if endpoint != self.session.endpoint() || self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return None;
        }
        Some(self.session.clone())
    }
}
