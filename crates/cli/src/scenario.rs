//! Scripted sessions against a simulated pool.

use crate::context::ConsoleContext;
use crate::sim::{SimulatedEndpoint, SimulatedWork, TaskScript};
use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use xenops_core::{metadata_keys, EndpointId, RemoteSession, RemoteTask, RemoteTaskStatus, TaskRef};
use xenops_reconcile::{Classification, RehydrateSummary};
use xenops_registry::OperationRecord;

const FOREIGN_OWNER: &str = "other-console";
const FOREIGN_INSTALLATION: &str = "other-installation";

/// Parameters of `xenops simulate`.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Local operations to launch
    pub count: usize,
    /// Run them in parallel with this cap
    pub parallel: Option<usize>,
    /// Stop the batch after the first failure
    pub stop_on_first_failure: bool,
    /// Indexes of local operations that fail
    pub fail: Vec<usize>,
    /// Tasks started by another console
    pub foreign: usize,
    /// Progress steps per task
    pub steps: u32,
    /// Delay between steps
    pub step: Duration,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            count: 4,
            parallel: None,
            stop_on_first_failure: false,
            fail: Vec::new(),
            foreign: 2,
            steps: 5,
            step: Duration::from_millis(100),
        }
    }
}

/// What a simulation left behind.
#[derive(Debug)]
pub struct SimulationOutcome {
    /// Operations started by the launcher
    pub launched: usize,
    /// Operations skipped for an unreachable endpoint
    pub skipped: usize,
    /// Operations prepared for restart at shutdown
    pub prepared: usize,
    /// Final history
    pub records: Vec<OperationRecord>,
}

/// Launch local work next to foreign work and let the reconciler pick the
/// foreign tasks up.
pub async fn simulate(ctx: &ConsoleContext, options: &SimulateOptions) -> Result<SimulationOutcome> {
    let sim = SimulatedEndpoint::new("pool-sim", ctx.clock.clone());
    let pump = ctx.connect(&sim);
    let sweeper = ctx.start_sweeper();

    let created = ctx.clock.now() - chrono::Duration::minutes(1);
    for index in 0..options.foreign {
        let task = RemoteTask::pending(sim.next_reference().0, "Async.VM.clean_reboot", created)
            .with_metadata(metadata_keys::OWNER_ID, FOREIGN_OWNER)
            .with_metadata(metadata_keys::OWNER_INSTALLATION, FOREIGN_INSTALLATION)
            .with_metadata(metadata_keys::APPLIES_TO, format!("vm-foreign-{index}"));
        let reference = task.reference.clone();
        sim.insert(task);
        sim.drive(
            reference,
            TaskScript::succeed(options.steps, options.step).then_remove(options.step),
        );
    }

    let operations = (0..options.count)
        .map(|index| {
            let vm = format!("vm-{index}");
            let script = if options.fail.contains(&index) {
                TaskScript::fail(options.steps, options.step, vec!["VM_FAILED_START".to_string(), vm.clone()])
            } else {
                TaskScript::succeed(options.steps, options.step)
            };
            SimulatedWork::operation(
                format!("Start {vm}"),
                sim.clone(),
                ctx.identity.clone(),
                "Async.VM.start",
                vec![vm],
                script,
                options.step,
            )
        })
        .collect();

    let mut request = ctx
        .launcher
        .request("Start VMs")
        .stop_on_first_failure(options.stop_on_first_failure);
    if let Some(max_parallel) = options.parallel {
        request = request.parallel(max_parallel);
    }
    let report = ctx.launcher.launch(&request, operations);
    let launched = report.launched.len();
    for (operation, handle) in report.launched {
        handle.await?;
        info!(title = %operation.title(), state = %operation.state(), "local operation finished");
    }

    // Foreign tasks finish on their own schedule.
    let mut waited = 0;
    while ctx.reconciler.matched_count() > 0 {
        if waited >= 100 {
            warn!(matched = ctx.reconciler.matched_count(), "foreign tasks still running");
            break;
        }
        tokio::time::sleep(options.step).await;
        waited += 1;
    }

    let prepared = ctx.shutdown().await;
    pump.await?;
    sweeper.await?;

    Ok(SimulationOutcome {
        launched,
        skipped: report.skipped.len(),
        prepared,
        records: ctx.registry.records(),
    })
}

/// Classification of one seeded task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Task reference
    pub task: TaskRef,
    /// What the seed represents
    pub label: String,
    /// Where the reconciler put it
    pub classification: Classification,
}

/// Result of `xenops rehydrate`.
#[derive(Debug, Clone, Serialize)]
pub struct RehydrationOutcome {
    /// Counts from the enumeration
    pub summary: RehydrateSummary,
    /// Per-task classification, in seed order
    pub tasks: Vec<TaskReport>,
}

/// Seed a pool with the task shapes a restarted console meets, then
/// rehydrate it.
pub async fn rehydrate(ctx: &ConsoleContext) -> Result<RehydrationOutcome> {
    let sim = SimulatedEndpoint::new("pool-rehydrate", ctx.clock.clone());
    ctx.sessions.insert(sim.clone());

    let now = ctx.clock.now();
    let old = now - chrono::Duration::minutes(5);
    let identity = &ctx.identity;
    let seeds = vec![
        (
            "started by this process",
            RemoteTask::pending("", "Async.VM.start", now)
                .with_metadata(metadata_keys::OWNER_ID, identity.application_id.clone())
                .with_metadata(metadata_keys::OWNER_INSTALLATION, identity.installation_id.clone()),
        ),
        (
            "left over by a previous run of this installation",
            RemoteTask::pending("", "Async.VM.pool_migrate", old)
                .with_metadata(metadata_keys::OWNER_ID, "previous-run")
                .with_metadata(metadata_keys::OWNER_INSTALLATION, identity.installation_id.clone()),
        ),
        (
            "foreign, just created",
            RemoteTask::pending("", "Async.VM.clone", now),
        ),
        (
            "foreign, targets a known object",
            RemoteTask::pending("", "Async.VM.suspend", now).with_metadata(metadata_keys::APPLIES_TO, "vm-7"),
        ),
        (
            "foreign, long running",
            RemoteTask::pending("", "Async.VM.export", old).with_progress(0.4),
        ),
        (
            "subtask",
            RemoteTask::pending("", "VM.snapshot", old).with_parent("OpaqueRef:parent"),
        ),
        (
            "already finished",
            RemoteTask::pending("", "Async.VM.copy", old).with_status(RemoteTaskStatus::Success),
        ),
    ];

    let mut labels = Vec::with_capacity(seeds.len());
    for (label, mut task) in seeds {
        task.reference = sim.next_reference();
        labels.push((task.reference.clone(), label));
        sim.insert(task);
    }

    let endpoint: EndpointId = sim.endpoint().clone();
    let summary = ctx.reconciler.rehydrate(&endpoint).await?;
    let tasks = labels
        .into_iter()
        .map(|(task, label)| TaskReport {
            classification: ctx.reconciler.classification(&endpoint, &task),
            task,
            label: label.to_string(),
        })
        .collect();

    ctx.shutdown().await;
    Ok(RehydrationOutcome { summary, tasks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use std::sync::Arc;
    use xenops_core::{Clock, OperationState, SystemClock};

    fn context(config: ConsoleConfig) -> ConsoleContext {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        ConsoleContext::new(config, clock)
    }

    fn quick(count: usize) -> SimulateOptions {
        SimulateOptions {
            count,
            steps: 3,
            step: Duration::from_millis(20),
            ..SimulateOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_simulation_reports_single_failure_verbatim() {
        let ctx = context(ConsoleConfig::default());
        let options = SimulateOptions {
            fail: vec![1],
            ..quick(3)
        };
        let outcome = simulate(&ctx, &options).await.unwrap();

        assert_eq!(outcome.launched, 1);
        assert_eq!(outcome.skipped, 0);

        let batch = outcome.records.iter().find(|r| r.title == "Start VMs").unwrap();
        assert_eq!(batch.state, OperationState::Failed);
        assert_eq!(batch.error.as_ref().unwrap().message, "VM_FAILED_START");
        assert!(outcome.records.iter().all(|r| !r.title.starts_with("Start vm-")));

        let foreign: Vec<_> = outcome.records.iter().filter(|r| r.title == "Rebooting VM").collect();
        assert_eq!(foreign.len(), 2);
        assert!(foreign.iter().all(|r| r.state == OperationState::Completed));
        assert!(foreign.iter().all(|r| !r.can_cancel));
    }

    #[tokio::test(start_paused = true)]
    async fn local_tasks_are_never_adopted() {
        let ctx = context(ConsoleConfig::default());
        let outcome = simulate(&ctx, &SimulateOptions { foreign: 0, ..quick(2) }).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].state, OperationState::Completed);
        assert_eq!(outcome.records[0].percent_complete, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_simulation_aggregates_failures() {
        let ctx = context(ConsoleConfig::default());
        let options = SimulateOptions {
            parallel: Some(2),
            fail: vec![0, 2],
            foreign: 0,
            ..quick(4)
        };
        let outcome = simulate(&ctx, &options).await.unwrap();
        let batch = &outcome.records[0];
        assert_eq!(batch.state, OperationState::Failed);
        assert_eq!(batch.error.as_ref().unwrap().message, "2 operations failed");
    }

    #[tokio::test]
    async fn rehydration_classifies_seeded_tasks() {
        let ctx = context(ConsoleConfig::default());
        let outcome = rehydrate(&ctx).await.unwrap();

        let by_label = |label: &str| {
            outcome
                .tasks
                .iter()
                .find(|t| t.label.starts_with(label))
                .map(|t| t.classification)
                .unwrap()
        };
        assert_eq!(by_label("started by this process"), Classification::Ignored);
        assert_eq!(by_label("left over"), Classification::Matched);
        assert_eq!(by_label("foreign, just created"), Classification::Unmatched);
        assert_eq!(by_label("foreign, targets"), Classification::Matched);
        assert_eq!(by_label("foreign, long running"), Classification::Matched);
        assert_eq!(by_label("subtask"), Classification::Ignored);
        assert_eq!(by_label("already finished"), Classification::Ignored);

        assert_eq!(outcome.summary.enumerated, 7);
        assert_eq!(outcome.summary.matched, 3);
        assert_eq!(outcome.summary.unmatched, 1);
        assert_eq!(outcome.summary.ignored, 3);

        let leftover = outcome.tasks.iter().find(|t| t.label.starts_with("left over")).unwrap();
        let meddling = ctx
            .reconciler
            .matched_operation(&EndpointId::new("pool-rehydrate"), &leftover.task)
            .unwrap();
        assert!(meddling.is_ours());
        assert!(meddling.operation().can_cancel());
    }
}
