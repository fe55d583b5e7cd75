//! Session abstraction consumed from the connection layer.

use crate::error::SessionResult;
use crate::id::{EndpointId, TaskRef};
use crate::task::RemoteTask;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// An authenticated connection to one endpoint of the control plane.
///
/// The session is owned by the connection layer. Implementations must be
/// cheap to query for [`is_logged_in`](RemoteSession::is_logged_in); callers
/// check it before every remote call.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// The endpoint this session talks to.
    fn endpoint(&self) -> &EndpointId;

    /// Whether the session is currently authenticated.
    fn is_logged_in(&self) -> bool;

    /// Fetch one task. `Ok(None)` if the task no longer exists.
    async fn get_task(&self, task: &TaskRef) -> SessionResult<Option<RemoteTask>>;

    /// Enumerate every task record known to the endpoint.
    async fn enumerate_tasks(&self) -> SessionResult<HashMap<TaskRef, RemoteTask>>;

    /// Ask the control plane to cancel a task.
    async fn cancel_task(&self, task: &TaskRef) -> SessionResult<()>;

    /// Set a key in the task's other-config map.
    async fn set_task_metadata(&self, task: &TaskRef, key: &str, value: &str) -> SessionResult<()>;

    /// Remove a key from the task's other-config map.
    async fn remove_task_metadata(&self, task: &TaskRef, key: &str) -> SessionResult<()>;
}

/// Resolves the session backing an endpoint.
pub trait SessionProvider: Send + Sync {
    /// The session for `endpoint`, if a connection exists.
    fn session(&self, endpoint: &EndpointId) -> Option<Arc<dyn RemoteSession>>;

    /// Whether the endpoint is connected and logged in.
    fn is_reachable(&self, endpoint: &EndpointId) -> bool {
        self.session(endpoint).map_or(false, |s| s.is_logged_in())
    }
}

/// Session provider backed by a map the connection layer keeps up to date.
#[derive(Default)]
pub struct StaticSessionProvider {
    sessions: RwLock<HashMap<EndpointId, Arc<dyn RemoteSession>>>,
}

impl StaticSessionProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the session for its endpoint, replacing any previous one.
    pub fn insert(&self, session: Arc<dyn RemoteSession>) {
        let endpoint = session.endpoint().clone();
        self.sessions.write().insert(endpoint, session);
    }

    /// Forget the session of a disconnected endpoint.
    pub fn remove(&self, endpoint: &EndpointId) -> Option<Arc<dyn RemoteSession>> {
        self.sessions.write().remove(endpoint)
    }

    /// Endpoints with a registered session.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.sessions.read().keys().cloned().collect()
    }
}

impl SessionProvider for StaticSessionProvider {
    fn session(&self, endpoint: &EndpointId) -> Option<Arc<dyn RemoteSession>> {
        self.sessions.read().get(endpoint).cloned()
    }
}
