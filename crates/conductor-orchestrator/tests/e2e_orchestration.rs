//! End-to-end orchestration tests.
//!
//! Drives the coordinator, worker loops, supervisor and optimizer together
//! with scripted executors writing into a temporary workspace.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_core::{ConductorConfig, ConductorError, ConductorResult};
use conductor_orchestrator::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn coordinator(workspace: &Path) -> Arc<Coordinator> {
    let conflicts = Arc::new(ConflictPrevention::new(
        workspace,
        chrono::Duration::minutes(30),
        true,
    ));
    let c = Coordinator::new("e2e", workspace, conflicts, 2);
    for agent in ["agent-1", "agent-2", "agent-3"] {
        c.register_agent(agent, AgentKind::worker("general"));
    }
    Arc::new(c)
}

fn artifacts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Writes every declared artifact into the shared workspace.
struct FileWriter {
    calls: AtomicUsize,
}

#[async_trait]
impl WorkExecutor for FileWriter {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ConductorResult<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for artifact in &task.artifacts {
            let path = ctx.workspace.join(artifact);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, format!("{} by {}\n", task.id, ctx.agent_id)).await?;
        }
        Ok(ExecutionOutcome::succeeded(task.artifacts.clone()))
    }
}

/// Fails with a parse error on the first attempt of each task.
struct FlakyWriter {
    inner: FileWriter,
    failed: parking_lot::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl WorkExecutor for FlakyWriter {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ConductorResult<ExecutionOutcome> {
        if self.failed.lock().insert(task.id.clone()) {
            return Err(ConductorError::Executor("failed to parse model output".into()));
        }
        self.inner.execute(task, ctx).await
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn fast_worker_settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        checkpoint_interval: Duration::from_millis(200),
        task_timeout: Duration::from_secs(10),
    }
}

// ---------------------------------------------------------------------------
// Coordinator scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lock_blocks_overlapping_task_until_integration() {
    let dir = tempfile::tempdir().unwrap();
    let c = coordinator(dir.path());
    c.add_tasks(vec![
        Task::new("A", "Write x").with_artifacts(["x.txt"]),
        Task::new("B", "Write y")
            .with_dependencies(["A"])
            .with_artifacts(["y.txt"]),
        Task::new("C", "Touch x").with_artifacts(["x.txt"]),
    ])
    .await
    .unwrap();
    assert_eq!(c.task("A").unwrap().status, TaskStatus::Ready);
    assert_eq!(c.task("B").unwrap().status, TaskStatus::Blocked);

    c.assign_task("A", "agent-1").await.unwrap();
    let err = c.assign_task("C", "agent-3").await.unwrap_err();
    assert!(matches!(err, ConductorError::Conflict(_)));
    assert!(c.would_conflict("C", "agent-3").is_some());

    let outcome = c
        .complete_task("A", "agent-1", artifacts(&["x.txt"]))
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(outcome.cascaded >= 1);
    assert_eq!(c.task("B").unwrap().status, TaskStatus::Ready);

    c.assign_task("B", "agent-2").await.unwrap();
    c.assign_task("C", "agent-3").await.unwrap();
    assert_eq!(c.task("C").unwrap().assigned_agent.as_deref(), Some("agent-3"));
}

#[tokio::test]
async fn test_completion_cascades_to_every_dependent() {
    let dir = tempfile::tempdir().unwrap();
    let c = coordinator(dir.path());
    c.add_tasks(vec![
        Task::new("A", "Root"),
        Task::new("B", "Left").with_dependencies(["A"]),
        Task::new("C", "Right").with_dependencies(["A"]),
        Task::new("D", "Join").with_dependencies(["B", "C"]),
    ])
    .await
    .unwrap();

    c.assign_task("A", "agent-1").await.unwrap();
    let outcome = c.complete_task("A", "agent-1", Vec::new()).await.unwrap();
    assert_eq!(outcome.cascaded, 2);
    assert_eq!(c.task("B").unwrap().status, TaskStatus::Ready);
    assert_eq!(c.task("C").unwrap().status, TaskStatus::Ready);
    let d = c.task("D").unwrap();
    assert_eq!(d.status, TaskStatus::Blocked);
    assert_eq!(d.blocker_type, Some(BlockerType::Dependency));
}

#[tokio::test]
async fn test_completed_tasks_never_regress() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("x.txt"), "x").await.unwrap();
    let c = coordinator(dir.path());
    c.add_task(Task::new("A", "Write x").with_artifacts(["x.txt"]))
        .await
        .unwrap();
    c.assign_task("A", "agent-1").await.unwrap();
    c.complete_task("A", "agent-1", artifacts(&["x.txt"])).await.unwrap();

    for status in [TaskStatus::Blocked, TaskStatus::Ready, TaskStatus::InProgress, TaskStatus::Failed] {
        let result = c
            .process_message(AgentMessage::status_update("agent-1", "A", status, Some(10), None))
            .await;
        assert!(result.is_err(), "{status} must be rejected");
    }
    assert!(c.start_task("A", "agent-1").await.is_err());
    assert!(c.requeue_task("A", "again").await.is_err());

    let supervisor = Supervisor::new("supervisor", c.clone(), SupervisorSettings::default());
    for _ in 0..3 {
        supervisor.audit().await;
    }
    let a = c.task("A").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.progress, 100);
    assert!(a.completed_at.is_some());
}

#[tokio::test]
async fn test_deadlock_breaker_is_idempotent_and_budgeted() {
    let dir = tempfile::tempdir().unwrap();
    let c = coordinator(dir.path());
    c.add_task(Task::new("A", "Flaky")).await.unwrap();
    let supervisor = Supervisor::new("supervisor", c.clone(), SupervisorSettings::default());

    let mut releases = Vec::new();
    for round in 0..6 {
        if c.task("A").unwrap().status == TaskStatus::Ready {
            c.assign_task("A", "agent-1").await.unwrap();
            c.process_message(AgentMessage::status_update(
                "agent-1",
                "A",
                TaskStatus::Blocked,
                None,
                Some("locked by agent-2".into()),
            ))
            .await
            .unwrap();
        }
        let report = supervisor.audit().await;
        let released = report
            .actions
            .iter()
            .filter(|a| matches!(a, FixAction::BlockerRequeued { task_id, .. } if task_id == "A"))
            .count();
        assert!(released <= 1, "round {round} released A {released} times");
        releases.push(released);
    }
    assert_eq!(releases.iter().sum::<usize>(), 2);
    let a = c.task("A").unwrap();
    assert_eq!(a.status, TaskStatus::Blocked);
    assert_eq!(a.retry_count(), 3);
}

#[tokio::test]
async fn test_no_double_assignment_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let c = coordinator(dir.path());
    let tasks: Vec<Task> = (0..8)
        .map(|i| Task::new(format!("t{i}"), "shared").with_artifacts(["shared.txt"]))
        .collect();
    c.add_tasks(tasks).await.unwrap();

    let mut handles = Vec::new();
    for agent in ["agent-1", "agent-2", "agent-3"] {
        let c = c.clone();
        handles.push(tokio::spawn(async move {
            let mut won = 0;
            for task in c.get_ready_tasks() {
                if c.assign_task(&task.id, agent).await.is_ok() {
                    won += 1;
                }
            }
            won
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, 1);
    let active: Vec<Task> = c.tasks().into_iter().filter(|t| t.status.is_active()).collect();
    assert_eq!(active.len(), 1);
}

// ---------------------------------------------------------------------------
// Full runtime
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_workers_supervisor_and_optimizer_finish_project() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("tasks.json");
    let store = Arc::new(JsonFileTaskStore::new(&store_path));

    let mut config = ConductorConfig::default();
    config.workspace = dir.path().to_path_buf();
    config.project = "e2e".into();
    let coordinator = Arc::new(Coordinator::from_config(&config).with_store(store.clone()));
    coordinator
        .add_tasks(vec![
            Task::new("schema", "Schema").with_artifacts(["db/schema.sql"]),
            Task::new("api", "API")
                .with_dependencies(["schema"])
                .with_artifacts(["src/api.rs"]),
            Task::new("ui", "UI")
                .with_dependencies(["schema"])
                .with_artifacts(["src/ui.rs"]),
            Task::new("docs", "Docs")
                .with_dependencies(["api", "ui"])
                .with_artifacts(["README.md"]),
        ])
        .await
        .unwrap();

    let executor = Arc::new(FlakyWriter {
        inner: FileWriter {
            calls: AtomicUsize::new(0),
        },
        failed: parking_lot::Mutex::new(Default::default()),
    });

    let spawner = Arc::new(AgentSpawner::new());
    {
        let coordinator = coordinator.clone();
        let executor = executor.clone();
        let factory: SpawnFactory = Arc::new(move |req: &SpawnRequest| {
            Ok(Arc::new(WorkerAgent::new(
                req.agent_id.clone(),
                req.specialization.clone(),
                coordinator.clone(),
                executor.clone(),
                fast_worker_settings(),
            )) as Arc<dyn Agent>)
        });
        spawner.register("general", factory);
    }
    for _ in 0..2 {
        spawner.spawn("general", None).await.unwrap();
    }

    let mut settings = SupervisorSettings::from_config(&config);
    settings.audit_interval = Duration::from_millis(50);
    let supervisor = Supervisor::new("supervisor", coordinator.clone(), settings)
        .with_spawner(spawner.clone());
    supervisor.start().await.unwrap();

    let optimizer = Arc::new(ParallelOptimizer::new(coordinator.clone(), Duration::from_millis(25)));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let optimizer_handle = tokio::spawn(Arc::clone(&optimizer).run(shutdown_rx));

    wait_until(|| coordinator.is_done()).await;

    shutdown_tx.send(true).unwrap();
    optimizer_handle.await.unwrap();
    supervisor.stop().await.unwrap();
    spawner.stop_all().await.unwrap();

    for id in ["schema", "api", "ui", "docs"] {
        let task = coordinator.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{id}");
        assert!(task.retry_count() >= 1, "{id} should have been retried once");
        for artifact in &task.artifacts {
            assert!(dir.path().join(artifact).exists(), "{artifact} missing");
        }
    }
    assert_eq!(executor.inner.calls.load(Ordering::SeqCst), 4);

    let persisted = store.load_tasks().await.unwrap();
    assert_eq!(persisted.len(), 4);
    assert!(persisted.iter().all(Task::is_completed));

    let status = coordinator.status();
    assert_eq!(status.counts[&TaskStatus::Completed], 4);
    assert!(status.conflict_prevention.integrated_change_sets >= 4);
    assert_eq!(status.conflict_prevention.active_locks, 0);
    assert_eq!(optimizer.metrics().current_parallel, 0);
}
