//! Wiring of registry, reconciler and launcher for one console process.

use crate::config::ConsoleConfig;
use crate::sim::{pump_changes, SimulatedEndpoint};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use xenops_batch::BatchLauncher;
use xenops_core::{AppIdentity, Clock, RemoteSession, StaticSessionProvider, UlidGenerator};
use xenops_reconcile::Reconciler;
use xenops_registry::OperationRegistry;

/// Shared services of a running console.
pub struct ConsoleContext {
    /// Effective configuration
    pub config: ConsoleConfig,
    /// Identity of this process
    pub identity: AppIdentity,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Connected endpoints
    pub sessions: Arc<StaticSessionProvider>,
    /// Operation history
    pub registry: Arc<OperationRegistry>,
    /// Rehydration of foreign tasks
    pub reconciler: Arc<Reconciler>,
    /// Per-endpoint batch launcher
    pub launcher: BatchLauncher,
    shutdown: CancellationToken,
}

impl ConsoleContext {
    /// Build the services described by `config`.
    pub fn new(config: ConsoleConfig, clock: Arc<dyn Clock>) -> Self {
        let identity = config.identity.identity();
        let sessions = Arc::new(StaticSessionProvider::new());
        let registry = Arc::new(OperationRegistry::with_config(
            clock.clone(),
            Arc::new(UlidGenerator),
            config.registry.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            sessions.clone(),
            clock.clone(),
            identity.clone(),
            config.reconciler.clone(),
        ));
        let launcher = BatchLauncher::new(registry.clone(), sessions.clone(), config.batch.clone());

        info!(
            application = %identity.application_id,
            installation = %identity.installation_id,
            "console started"
        );

        Self {
            config,
            identity,
            clock,
            sessions,
            registry,
            reconciler,
            launcher,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register `endpoint` and start feeding its changes to the reconciler.
    pub fn connect(&self, endpoint: &Arc<SimulatedEndpoint>) -> JoinHandle<()> {
        let changes = endpoint.subscribe();
        self.sessions.insert(endpoint.clone());
        pump_changes(
            self.reconciler.clone(),
            endpoint.endpoint().clone(),
            changes,
            self.shutdown.child_token(),
        )
    }

    /// Start the periodic promotion of unmatched tasks.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.reconciler.spawn_sweeper(self.shutdown.child_token())
    }

    /// Stop background work and scrub ownership tags of running operations.
    ///
    /// Returns the number of operations prepared for restart.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let prepared = self.registry.prepare_all_for_restart().await;
        info!(prepared, "console shut down");
        prepared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::sim::{SimulatedWork, TaskScript};
    use xenops_core::{metadata_keys, EndpointId, OperationState, RemoteTask, SystemClock, TaskRef};
    use xenops_reconcile::Classification;

    #[tokio::test]
    async fn connected_endpoint_feeds_the_reconciler() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ctx = ConsoleContext::new(ConsoleConfig::default(), clock.clone());
        let sim = SimulatedEndpoint::new("pool-a", clock.clone());
        let pump = ctx.connect(&sim);

        let old = clock.now() - chrono::Duration::seconds(30);
        sim.insert(
            RemoteTask::pending("OpaqueRef:foreign", "Async.VM.clean_shutdown", old)
                .with_metadata(metadata_keys::OWNER_ID, "someone-else"),
        );

        let endpoint = EndpointId::new("pool-a");
        let task = TaskRef::new("OpaqueRef:foreign");
        let mut matched = false;
        for _ in 0..100 {
            if ctx.reconciler.classification(&endpoint, &task) == Classification::Matched {
                matched = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matched);
        assert!(ctx.registry.find_by_task(&endpoint, &task).is_some());

        ctx.shutdown().await;
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_scrubs_ownership_of_running_local_work() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ctx = ConsoleContext::new(ConsoleConfig::default(), clock.clone());
        let sim = SimulatedEndpoint::new("pool-a", clock);
        let work = SimulatedWork::operation(
            "Start VM",
            sim.clone(),
            ctx.identity.clone(),
            "Async.VM.start",
            vec!["vm-1".to_string()],
            TaskScript::succeed(100, Duration::from_millis(10)),
            Duration::from_millis(10),
        );
        ctx.registry.register(&work);
        work.start();

        // applies_to is the last tag written when the work claims its task.
        let mut claimed = None;
        for _ in 0..100 {
            if let Some(task) = work.related_task() {
                let tagged = sim
                    .task(&task)
                    .map_or(false, |t| t.other_config.contains_key(metadata_keys::APPLIES_TO));
                if tagged {
                    claimed = Some(task);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let task = claimed.expect("work never claimed its task");

        assert_eq!(ctx.shutdown().await, 1);
        let record = sim.task(&task).unwrap();
        for key in metadata_keys::OWNERSHIP {
            assert!(!record.other_config.contains_key(key), "{key} still set");
        }
        assert_eq!(
            record.other_config.get(metadata_keys::APPLIES_TO).map(String::as_str),
            Some("vm-1")
        );
        assert_eq!(work.state(), OperationState::Running);
    }
}
