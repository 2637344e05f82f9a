//! Out-of-band auditor for the shared task table.
//!
//! Every pass runs the checks in a fixed order and fixes what it finds
//! before moving on:
//!
//! 0. re-resolve dependency state
//! 1. completed tasks with missing artifacts get a restore task
//! 2. stuck IN_PROGRESS tasks are reset or flagged
//! 3. unresponsive agents are stopped and replaced
//! 4. deadlock breakers, only on a global stall
//! 5. spurious "everything completed" rollback
//!
//! Each fix is bounded by a retry budget so repeated passes never oscillate.

use crate::agent::{wait_while_paused, Agent, AgentControl, AgentRuntime};
use crate::blocker::{is_conflict_rejection, is_transient_failure};
use crate::coordinator::Coordinator;
use crate::spawner::AgentSpawner;
use crate::types::{AgentKind, AgentState, BlockerType, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conductor_core::{ConductorConfig, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Note stored on tasks taken back from an unresponsive agent.
pub const UNRESPONSIVE_NOTE: &str = "requeued from unresponsive agent";

/// Category of an audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    StaleDependencyState,
    MissingArtifacts,
    StuckTask,
    UnresponsiveAgent,
    Deadlock,
    SpuriousCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub detail: String,
}

/// Which deadlock breaker released a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breaker {
    TransientFailure,
    ConflictRejection,
    Environment,
}

/// A corrective action taken during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum FixAction {
    Resolved { tasks: Vec<TaskId> },
    RestoreTaskCreated { original: TaskId, restore: TaskId },
    TaskReset { task_id: TaskId, status: TaskStatus },
    ManualAttention { task_id: TaskId },
    AgentStopped { agent_id: String, requeued: Vec<TaskId> },
    AgentSpawned { replaces: String, agent_id: String },
    BlockerRequeued { task_id: TaskId, breaker: Breaker },
    CompletionReverted { task_id: TaskId, status: TaskStatus },
}

/// Outcome of one audit pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub issues: Vec<Issue>,
    pub actions: Vec<FixAction>,
}

impl AuditReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            issues: Vec::new(),
            actions: Vec::new(),
        }
    }

    fn issue(&mut self, kind: IssueKind, task_id: Option<&str>, agent_id: Option<&str>, detail: String) {
        self.issues.push(Issue {
            kind,
            task_id: task_id.map(str::to_string),
            agent_id: agent_id.map(str::to_string),
            detail,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.actions.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }
}

/// Answers whether an artifact exists in the workspace.
pub trait ArtifactProbe: Send + Sync {
    fn exists(&self, workspace: &Path, artifact: &str) -> bool;
}

/// Checks the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsArtifactProbe;

impl ArtifactProbe for FsArtifactProbe {
    fn exists(&self, workspace: &Path, artifact: &str) -> bool {
        let path = Path::new(artifact);
        if path.is_absolute() {
            path.exists()
        } else {
            workspace.join(path).exists()
        }
    }
}

/// Thresholds and budgets for the audit checks.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub audit_interval: std::time::Duration,
    pub stale_task: Duration,
    pub no_checkpoint_reset: Duration,
    pub max_in_flight: Duration,
    pub unresponsive_agent: Duration,
    pub retry_budget: u32,
    pub environment_cooldown: Duration,
    pub recent_completion: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &ConductorConfig) -> Self {
        let s = &config.supervisor;
        Self {
            audit_interval: config.supervisor.audit_interval(),
            stale_task: crate::secs(s.stale_task_secs),
            no_checkpoint_reset: crate::secs(s.no_checkpoint_reset_secs),
            max_in_flight: crate::secs(s.max_in_flight_secs),
            unresponsive_agent: crate::secs(s.unresponsive_agent_secs),
            retry_budget: s.retry_budget,
            environment_cooldown: crate::secs(s.environment_cooldown_secs),
            recent_completion: crate::secs(s.recent_completion_secs),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ConductorConfig::default())
    }
}

struct SupervisorInner {
    id: String,
    coordinator: Arc<Coordinator>,
    spawner: Option<Arc<AgentSpawner>>,
    probe: Arc<dyn ArtifactProbe>,
    settings: SupervisorSettings,
    last_report: Mutex<Option<AuditReport>>,
}

/// Privileged, non-worker participant running the audit loop.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    runtime: AgentRuntime,
}

impl Supervisor {
    pub fn new(id: impl Into<String>, coordinator: Arc<Coordinator>, settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                id: id.into(),
                coordinator,
                spawner: None,
                probe: Arc::new(FsArtifactProbe),
                settings,
                last_report: Mutex::new(None),
            }),
            runtime: AgentRuntime::new(),
        }
    }

    /// Replacements for unresponsive agents come from `spawner`.
    ///
    /// Must be called before the supervisor is shared.
    pub fn with_spawner(mut self, spawner: Arc<AgentSpawner>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.spawner = Some(spawner);
        }
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ArtifactProbe>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.probe = probe;
        }
        self
    }

    /// Run one full audit pass now.
    pub async fn audit(&self) -> AuditReport {
        self.inner.audit().await
    }

    pub fn last_report(&self) -> Option<AuditReport> {
        self.inner.last_report.lock().clone()
    }
}

impl SupervisorInner {
    fn workspace(&self) -> &Path {
        self.coordinator.workspace()
    }

    fn missing_artifacts(&self, task: &Task) -> Vec<String> {
        task.artifacts
            .iter()
            .filter(|a| !self.probe.exists(self.workspace(), a))
            .cloned()
            .collect()
    }

    async fn audit(&self) -> AuditReport {
        let mut report = AuditReport::new();
        self.resolve_dependencies(&mut report).await;
        self.audit_completed_artifacts(&mut report).await;
        self.audit_stuck_tasks(&mut report).await;
        self.audit_unresponsive_agents(&mut report).await;
        self.break_deadlock(&mut report).await;
        self.audit_spurious_completion(&mut report).await;
        report.finished_at = Utc::now();

        if report.is_clean() {
            debug!(supervisor = %self.id, "Audit pass clean");
        } else {
            info!(
                supervisor = %self.id,
                issues = report.issues.len(),
                actions = report.actions.len(),
                "Audit pass finished"
            );
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }

    async fn resolve_dependencies(&self, report: &mut AuditReport) {
        let before: Vec<(TaskId, TaskStatus)> = self
            .coordinator
            .tasks()
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        if self.coordinator.resolve_all().await == 0 {
            return;
        }
        let changed: Vec<TaskId> = before
            .into_iter()
            .filter(|(id, status)| self.coordinator.task(id).is_some_and(|t| t.status != *status))
            .map(|(id, _)| id)
            .collect();
        for id in &changed {
            report.issue(
                IssueKind::StaleDependencyState,
                Some(id),
                None,
                "dependency state was stale".into(),
            );
        }
        report.actions.push(FixAction::Resolved { tasks: changed });
    }

    async fn audit_completed_artifacts(&self, report: &mut AuditReport) {
        let completed: Vec<Task> = self
            .coordinator
            .tasks()
            .into_iter()
            .filter(|t| t.is_completed() && !t.artifacts.is_empty() && !t.metadata.contains_key("restore_of"))
            .collect();

        for task in completed {
            let missing = self.missing_artifacts(&task);
            if missing.is_empty() {
                continue;
            }
            report.issue(
                IssueKind::MissingArtifacts,
                Some(&task.id),
                None,
                format!("missing artifacts: {}", missing.join(", ")),
            );

            let restores = self.coordinator.restore_tasks_of(&task.id);
            if restores.iter().any(|r| !r.status.is_terminal()) {
                continue;
            }
            if restores.len() >= self.settings.retry_budget as usize {
                warn!(task_id = %task.id, attempts = restores.len(), "Restore budget exhausted");
                report.actions.push(FixAction::ManualAttention { task_id: task.id.clone() });
                continue;
            }
            match self.coordinator.add_restore_task(&task.id, missing).await {
                Ok(restore) => report.actions.push(FixAction::RestoreTaskCreated {
                    original: task.id.clone(),
                    restore,
                }),
                Err(e) => warn!(task_id = %task.id, error = %e, "Could not create restore task"),
            }
        }
    }

    async fn audit_stuck_tasks(&self, report: &mut AuditReport) {
        let now = Utc::now();
        let s = &self.settings;
        for task in self.coordinator.tasks() {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let last_checkpoint = self.coordinator.last_checkpoint(&task.id).map(|c| c.timestamp);
            let Some(last_activity) = last_checkpoint.or(task.started_at) else {
                continue;
            };
            if now - last_activity < s.stale_task {
                continue;
            }

            let in_flight = task.started_at.map(|t| now - t);
            let reason = if task.progress == 0 {
                Some("no progress")
            } else if now - last_activity > s.no_checkpoint_reset {
                Some("no checkpoint")
            } else if in_flight.is_some_and(|d| d > s.max_in_flight) {
                Some("in flight too long")
            } else {
                None
            };
            let idle_secs = (now - last_activity).num_seconds();
            report.issue(
                IssueKind::StuckTask,
                Some(&task.id),
                task.assigned_agent.as_deref(),
                format!("no checkpoint activity for {idle_secs}s at {}%", task.progress),
            );

            match reason {
                Some(reason) => {
                    let note = format!("reset stuck task: {reason}");
                    match self.coordinator.requeue_task(&task.id, &note).await {
                        Ok(status) => report.actions.push(FixAction::TaskReset {
                            task_id: task.id.clone(),
                            status,
                        }),
                        Err(e) => warn!(task_id = %task.id, error = %e, "Could not reset stuck task"),
                    }
                }
                None => {
                    warn!(task_id = %task.id, progress = task.progress, "Stuck task needs manual attention");
                    report.actions.push(FixAction::ManualAttention { task_id: task.id.clone() });
                }
            }
        }
    }

    async fn audit_unresponsive_agents(&self, report: &mut AuditReport) {
        let stale = self
            .coordinator
            .monitor()
            .stale_agents(self.settings.unresponsive_agent);
        for agent_id in stale {
            if agent_id == self.id {
                continue;
            }
            let Some(record) = self.coordinator.agent(&agent_id) else {
                continue;
            };
            if !record.state.is_live() {
                continue;
            }
            report.issue(
                IssueKind::UnresponsiveAgent,
                None,
                Some(&agent_id),
                format!("no heartbeat for over {}s", self.settings.unresponsive_agent.num_seconds()),
            );

            if let Some(spawner) = &self.spawner {
                if let Err(e) = spawner.stop(&agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "Agent handle did not stop cleanly");
                }
            }
            match self.coordinator.stop_agent(&agent_id, UNRESPONSIVE_NOTE).await {
                Ok(requeued) => report.actions.push(FixAction::AgentStopped {
                    agent_id: agent_id.clone(),
                    requeued,
                }),
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Could not stop unresponsive agent");
                    continue;
                }
            }
            self.coordinator.monitor().forget(&agent_id);

            let (Some(spawner), Some(specialization)) = (&self.spawner, record.kind.specialization())
            else {
                continue;
            };
            match spawner.spawn(specialization, Some(&agent_id)).await {
                Ok(replacement) => report.actions.push(FixAction::AgentSpawned {
                    replaces: agent_id.clone(),
                    agent_id: replacement,
                }),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "No replacement spawned"),
            }
        }
    }

    /// Breakers only fire when nothing is READY, ASSIGNED or IN_PROGRESS.
    async fn break_deadlock(&self, report: &mut AuditReport) {
        let counts = self.coordinator.counts_by_status();
        let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        let blocked = count(TaskStatus::Blocked);
        if blocked == 0
            || count(TaskStatus::Ready) > 0
            || count(TaskStatus::Assigned) > 0
            || count(TaskStatus::InProgress) > 0
        {
            return;
        }
        report.issue(
            IssueKind::Deadlock,
            None,
            None,
            format!("{blocked} blocked tasks and nothing runnable"),
        );

        let now = Utc::now();
        let budget = self.settings.retry_budget;
        let mut environment_released = false;
        let mut candidates: Vec<Task> = self
            .coordinator
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        for task in candidates {
            let message = task.blocker_message.as_deref().unwrap_or_default();
            let within_budget = task.retry_count() <= budget;
            let breaker = if !within_budget {
                None
            } else if task.blocker_type == Some(BlockerType::Environment) {
                let cooled_down = task
                    .retry
                    .as_ref()
                    .map_or(true, |r| now - r.last_attempt >= self.settings.environment_cooldown);
                (cooled_down && !environment_released).then_some(Breaker::Environment)
            } else if task.blocker_type == Some(BlockerType::Conflict) || is_conflict_rejection(message) {
                Some(Breaker::ConflictRejection)
            } else if is_transient_failure(message, task.blocker_type) {
                Some(Breaker::TransientFailure)
            } else {
                None
            };
            let Some(breaker) = breaker else {
                continue;
            };

            let note = format!("deadlock breaker: {breaker:?}");
            match self.coordinator.requeue_task(&task.id, &note).await {
                Ok(_) => {
                    if breaker == Breaker::Environment {
                        environment_released = true;
                    }
                    info!(task_id = %task.id, ?breaker, repeats = task.retry_count(), "Deadlock broken");
                    report.actions.push(FixAction::BlockerRequeued {
                        task_id: task.id.clone(),
                        breaker,
                    });
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Breaker requeue failed"),
            }
        }
    }

    async fn audit_spurious_completion(&self, report: &mut AuditReport) {
        let tasks = self.coordinator.tasks();
        if tasks.is_empty() || !tasks.iter().all(Task::is_completed) {
            return;
        }
        let now = Utc::now();
        let recent = |t: &Task| {
            t.completed_at
                .is_some_and(|c| now - c < self.settings.recent_completion)
        };
        let has_output = |t: &Task| {
            !t.artifacts.is_empty()
                && t.artifacts.iter().all(|a| self.probe.exists(self.workspace(), a))
        };

        let without_output = tasks.iter().filter(|t| !has_output(t)).count();
        let not_recent = tasks.iter().filter(|t| !recent(t)).count();
        if without_output * 2 <= tasks.len() || not_recent * 2 <= tasks.len() {
            return;
        }
        let evidence = self.coordinator.conflicts().has_verified_output(self.workspace())
            || tasks.iter().any(|t| self.coordinator.has_completion_message(&t.id));
        if evidence {
            return;
        }

        report.issue(
            IssueKind::SpuriousCompletion,
            None,
            None,
            format!(
                "all {} tasks completed, {without_output} without output, {not_recent} not recent",
                tasks.len()
            ),
        );
        for task in tasks.iter().filter(|t| !has_output(t) && !recent(t)) {
            match self.coordinator.revert_unverified_completion(&task.id).await {
                Ok(status) => report.actions.push(FixAction::CompletionReverted {
                    task_id: task.id.clone(),
                    status,
                }),
                Err(e) => warn!(task_id = %task.id, error = %e, "Could not revert completion"),
            }
        }
    }

    async fn run(self: Arc<Self>, mut rx: watch::Receiver<AgentControl>) {
        self.coordinator.register_agent(&self.id, AgentKind::Supervisor);
        if let Err(e) = self
            .coordinator
            .record_heartbeat(&self.id, None, Some(AgentState::Running))
        {
            warn!(supervisor = %self.id, error = %e, "Heartbeat rejected");
        }
        info!(supervisor = %self.id, interval_secs = self.settings.audit_interval.as_secs(), "Supervisor started");

        let mut ticks = interval(self.settings.audit_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let _ = self.coordinator.record_heartbeat(&self.id, None, Some(AgentState::Running));
                    self.audit().await;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let control = *rx.borrow_and_update();
                    match control {
                        AgentControl::Stop => break,
                        AgentControl::Pause => {
                            let _ = self.coordinator.set_agent_state(&self.id, AgentState::Paused);
                            if !wait_while_paused(&mut rx).await {
                                break;
                            }
                            let _ = self.coordinator.set_agent_state(&self.id, AgentState::Running);
                        }
                        AgentControl::Run => {}
                    }
                }
            }
        }

        let _ = self.coordinator.set_agent_state(&self.id, AgentState::Stopped);
        info!(supervisor = %self.id, "Supervisor stopped");
    }
}

#[async_trait]
impl Agent for Supervisor {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Supervisor
    }

    async fn start(&self) -> ConductorResult<()> {
        let inner = Arc::clone(&self.inner);
        self.runtime.launch(move |rx| inner.run(rx))
    }

    async fn stop(&self) -> ConductorResult<()> {
        self.runtime.shutdown().await;
        Ok(())
    }

    async fn pause(&self) -> ConductorResult<()> {
        self.runtime.signal(AgentControl::Pause);
        Ok(())
    }

    async fn resume(&self) -> ConductorResult<()> {
        self.runtime.signal(AgentControl::Run);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.runtime.is_running()
    }
}
