//! The agent coordinator: sole owner of the task table and agent registry.
//!
//! Every mutation takes the task-table mutex for the duration of one state
//! transition, including its dependency cascade, and persists the touched
//! tasks only after releasing it. Lock order is task table, then resource
//! locks, then the agent registry.

use crate::blocker::{blocker_signature, classify_blocker, BlockerContext};
use crate::conflicts::{ChangeSet, ConflictPrevention, ConflictPreventionStatus};
use crate::monitor::AgentMonitor;
use crate::store::TaskStore;
use crate::task_table::TaskTable;
use crate::types::{
    AgentKind, AgentMessage, AgentRecord, AgentState, Checkpoint, MessageType, RetryState, Task,
    TaskId, TaskStatus,
};
use chrono::Utc;
use conductor_core::{ConductorConfig, ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of processing one agent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Dependents whose status changed as a consequence.
    pub cascaded: usize,
    /// Conflicts that kept a completion from being accepted.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub kind: AgentKind,
    pub state: AgentState,
    pub workload: usize,
}

/// Read-only projection of coordinator state for progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub project: String,
    pub total_tasks: usize,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub agents: Vec<AgentSummary>,
    pub ready: Vec<TaskId>,
    pub conflict_prevention: ConflictPreventionStatus,
    pub generated_at: chrono::DateTime<Utc>,
}

/// Owns the task table and the agent registry.
pub struct Coordinator {
    project: String,
    workspace: PathBuf,
    tasks: Mutex<TaskTable>,
    agents: RwLock<HashMap<String, AgentRecord>>,
    messages: Mutex<Vec<AgentMessage>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    conflicts: Arc<ConflictPrevention>,
    monitor: Arc<AgentMonitor>,
    store: Option<Arc<dyn TaskStore>>,
}

impl Coordinator {
    pub fn new(
        project: impl Into<String>,
        workspace: impl Into<PathBuf>,
        conflicts: Arc<ConflictPrevention>,
        retry_budget: u32,
    ) -> Self {
        Self {
            project: project.into(),
            workspace: workspace.into(),
            tasks: Mutex::new(TaskTable::new(retry_budget)),
            agents: RwLock::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
            conflicts,
            monitor: Arc::new(AgentMonitor::new()),
            store: None,
        }
    }

    pub fn from_config(config: &ConductorConfig) -> Self {
        Self::new(
            config.project.clone(),
            config.workspace.clone(),
            Arc::new(ConflictPrevention::from_config(config)),
            config.supervisor.retry_budget,
        )
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn conflicts(&self) -> &Arc<ConflictPrevention> {
        &self.conflicts
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn retry_budget(&self) -> u32 {
        self.tasks.lock().retry_budget()
    }

    /// Write the current state of `ids` to the store. Failures are logged.
    async fn persist(&self, mut ids: Vec<TaskId>) {
        let Some(store) = &self.store else {
            return;
        };
        ids.sort();
        ids.dedup();
        let snapshot: Vec<Task> = {
            let table = self.tasks.lock();
            ids.iter().filter_map(|id| table.get(id).cloned()).collect()
        };
        for task in snapshot {
            if let Err(e) = store.persist(&task).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        }
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Register an agent. Re-registering keeps the existing record.
    pub fn register_agent(&self, agent_id: &str, kind: AgentKind) -> AgentRecord {
        let record = {
            let mut agents = self.agents.write();
            agents
                .entry(agent_id.to_string())
                .or_insert_with(|| {
                    let now = Utc::now();
                    info!(agent_id, kind = ?kind, "Agent registered");
                    AgentRecord {
                        id: agent_id.to_string(),
                        kind,
                        state: AgentState::Created,
                        workload: 0,
                        registered_at: now,
                        state_changed_at: now,
                    }
                })
                .clone()
        };
        if self.monitor.last_heartbeat(agent_id).is_none() {
            self.monitor.record_heartbeat(agent_id, None, Some(record.state));
        }
        record
    }

    pub fn set_agent_state(&self, agent_id: &str, state: AgentState) -> ConductorResult<()> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))?;
        if record.state != state {
            debug!(agent_id, from = %record.state, to = %state, "Agent state changed");
            record.state = state;
            record.state_changed_at = Utc::now();
        }
        Ok(())
    }

    /// Heartbeat from an agent loop; optionally mirrors its state.
    pub fn record_heartbeat(
        &self,
        agent_id: &str,
        task_id: Option<&str>,
        state: Option<AgentState>,
    ) -> ConductorResult<()> {
        self.monitor.record_heartbeat(agent_id, task_id, state);
        if let Some(state) = state {
            self.set_agent_state(agent_id, state)?;
        }
        Ok(())
    }

    fn workloads(&self) -> HashMap<String, usize> {
        let table = self.tasks.lock();
        let mut loads = HashMap::new();
        for task in table.all() {
            if let (true, Some(agent)) = (task.status.is_active(), &task.assigned_agent) {
                *loads.entry(agent.clone()).or_insert(0) += 1;
            }
        }
        loads
    }

    /// Registry records with workload computed from the task table.
    pub fn agents(&self) -> Vec<AgentRecord> {
        let loads = self.workloads();
        let mut records: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        for record in &mut records {
            record.workload = loads.get(&record.id).copied().unwrap_or(0);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        let workload = self.workloads().get(agent_id).copied().unwrap_or(0);
        self.agents.read().get(agent_id).cloned().map(|mut r| {
            r.workload = workload;
            r
        })
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn add_task(&self, task: Task) -> ConductorResult<TaskId> {
        let id = task.id.clone();
        self.add_tasks(vec![task]).await?;
        Ok(id)
    }

    /// Insert a batch and resolve the whole table. Returns how many were added.
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> ConductorResult<usize> {
        let (added, touched) = {
            let mut table = self.tasks.lock();
            let mut touched = table.insert_all(tasks)?;
            let added = touched.len();
            touched.extend(table.resolve_all());
            (added, touched)
        };
        info!(project = %self.project, added, "Tasks added");
        self.persist(touched).await;
        Ok(added)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().all().into_iter().cloned().collect()
    }

    pub fn get_ready_tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .with_status(TaskStatus::Ready)
            .into_iter()
            .cloned()
            .collect()
    }

    /// The agent's ASSIGNED and IN_PROGRESS tasks, in-progress first.
    pub fn get_agent_tasks(&self, agent_id: &str) -> Vec<Task> {
        let table = self.tasks.lock();
        let mut owned: Vec<Task> = table
            .all()
            .into_iter()
            .filter(|t| t.status.is_active() && t.assigned_agent.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        owned.sort_by_key(|t| t.status != TaskStatus::InProgress);
        owned
    }

    pub fn counts_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        self.tasks.lock().counts_by_status()
    }

    pub fn is_done(&self) -> bool {
        self.tasks.lock().is_done()
    }

    /// Re-run dependency resolution over the whole table.
    pub async fn resolve_all(&self) -> usize {
        let changed = self.tasks.lock().resolve_all();
        let n = changed.len();
        if n > 0 {
            debug!(changed = n, "Dependency state repaired");
        }
        self.persist(changed).await;
        n
    }

    /// Why `agent_id` could not take `task_id` right now, if anything.
    pub fn would_conflict(&self, task_id: &str, agent_id: &str) -> Option<String> {
        let table = self.tasks.lock();
        let task = table.get(task_id)?;
        if let Some((other, owner)) = table.active_overlap(task, agent_id) {
            return Some(format!("overlaps with task {other} held by {owner}"));
        }
        self.conflicts.check_assignment(task, agent_id).err()
    }

    /// Assign a READY task, taking exclusive leases on its declared artifacts.
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> ConductorResult<()> {
        {
            let mut table = self.tasks.lock();
            let task = table
                .get(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Ready {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} is {}, not ready",
                    task.status
                )));
            }
            match self.agents.read().get(agent_id).map(|r| r.state) {
                None => return Err(ConductorError::AgentNotFound(agent_id.to_string())),
                Some(AgentState::Stopped | AgentState::Error) => {
                    return Err(ConductorError::InvalidTransition(format!(
                        "agent {agent_id} is not accepting work"
                    )))
                }
                Some(_) => {}
            }
            if let Some((other, owner)) = table.active_overlap(task, agent_id) {
                return Err(ConductorError::Conflict(format!(
                    "task {task_id} overlaps with task {other} held by {owner}"
                )));
            }
            self.conflicts
                .check_assignment(task, agent_id)
                .map_err(ConductorError::Conflict)?;
            self.conflicts.claim_resources(task, agent_id)?;

            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id.to_string());
        }
        info!(task_id, agent_id, "Task assigned");
        self.persist(vec![task_id.to_string()]).await;
        Ok(())
    }

    /// ASSIGNED to IN_PROGRESS for the owner; an idempotent resume when the
    /// owner already has it in progress.
    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> ConductorResult<()> {
        let changed = {
            let mut table = self.tasks.lock();
            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if task.is_completed() || task.progress >= 100 {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} is already complete"
                )));
            }
            let owned = task.assigned_agent.as_deref() == Some(agent_id);
            match task.status {
                TaskStatus::Assigned if owned => {
                    task.status = TaskStatus::InProgress;
                    task.started_at.get_or_insert_with(Utc::now);
                    true
                }
                TaskStatus::InProgress if owned => false,
                status => {
                    return Err(ConductorError::InvalidTransition(format!(
                        "task {task_id} is {status} and not held by {agent_id}"
                    )))
                }
            }
        };
        if changed {
            info!(task_id, agent_id, "Task started");
            self.persist(vec![task_id.to_string()]).await;
        } else {
            debug!(task_id, agent_id, "Task resumed");
        }
        Ok(())
    }

    /// Drop the task's owner and the leases taken for it.
    fn release_assignment(&self, task: &mut Task) {
        if let Some(agent) = task.assigned_agent.take() {
            self.conflicts.release_task_resources(task, &agent);
        }
    }

    /// Move a task into BLOCKED, classifying the reason and counting repeats.
    fn block(&self, task: &mut Task, message: &str, context: BlockerContext) {
        let kind = classify_blocker(message, context);
        let signature = blocker_signature(message);
        let count = match &task.retry {
            Some(prev) if prev.signature == signature => prev.count + 1,
            _ => 1,
        };
        task.retry = Some(RetryState {
            kind,
            signature,
            count,
            last_attempt: Utc::now(),
        });
        task.set_blocker(message, kind);
        task.status = TaskStatus::Blocked;
        self.release_assignment(task);
        warn!(task_id = %task.id, blocker = %kind, repeats = count, "Task blocked: {message}");
    }

    /// Apply an agent message. Every message is appended to the log first.
    pub async fn process_message(&self, message: AgentMessage) -> ConductorResult<MessageOutcome> {
        self.messages.lock().push(message.clone());
        let task_id = message.task_id.clone();
        let agent_id = message.agent_id.clone();

        let (outcome, touched) = match message.kind {
            MessageType::Completion => {
                return self
                    .complete_task(&task_id, &agent_id, message.artifacts)
                    .await
            }
            MessageType::StatusUpdate
                if message.status == Some(TaskStatus::Completed) =>
            {
                return self
                    .complete_task(&task_id, &agent_id, message.artifacts)
                    .await
            }
            MessageType::StatusUpdate => self.apply_status_update(&message)?,
            MessageType::Checkpoint => self.apply_checkpoint(&message)?,
            MessageType::DependencyRequest => self.apply_dependency_request(&message)?,
        };
        self.persist(touched).await;
        Ok(outcome)
    }

    fn apply_status_update(
        &self,
        message: &AgentMessage,
    ) -> ConductorResult<(MessageOutcome, Vec<TaskId>)> {
        let task_id = message.task_id.as_str();
        let new_status = message.status.ok_or_else(|| {
            ConductorError::Orchestrator(format!("status update for {task_id} carries no status"))
        })?;

        let mut table = self.tasks.lock();
        let task = table
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
        if task.is_completed() {
            return Err(ConductorError::InvalidTransition(format!(
                "task {task_id} is completed and cannot move to {new_status}"
            )));
        }
        if let Some(owner) = task.assigned_agent.as_deref() {
            if owner != message.agent_id {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} is held by {owner}, not {}",
                    message.agent_id
                )));
            }
        }

        let old_status = task.status;
        if let Some(progress) = message.progress {
            task.progress = progress.min(100);
        }
        let busy = busy_ms(task);

        match new_status {
            TaskStatus::Blocked => {
                let reason = message.message.as_deref().unwrap_or("blocked");
                self.block(task, reason, BlockerContext::StatusUpdate);
                self.monitor.record_blocked(&message.agent_id, busy);
            }
            TaskStatus::Review => {
                merge_artifacts(task, &message.artifacts);
                if !message.artifacts.is_empty() {
                    self.conflicts.register(
                        ChangeSet::new(&message.agent_id, task_id)
                            .with_modified(message.artifacts.clone())
                            .with_description(task.title.clone()),
                    );
                }
                task.clear_blocker();
                task.status = TaskStatus::Review;
            }
            TaskStatus::Failed => {
                let reason = message.message.as_deref().unwrap_or("failed");
                task.set_blocker(reason, classify_blocker(reason, BlockerContext::StatusUpdate));
                task.status = TaskStatus::Failed;
                self.release_assignment(task);
            }
            TaskStatus::Pending | TaskStatus::Ready => {
                task.clear_blocker();
                task.status = new_status;
                self.release_assignment(task);
            }
            TaskStatus::Assigned | TaskStatus::InProgress => {
                if task.assigned_agent.as_deref() != Some(message.agent_id.as_str()) {
                    return Err(ConductorError::InvalidTransition(format!(
                        "task {task_id} is not held by {}",
                        message.agent_id
                    )));
                }
                task.clear_blocker();
                if new_status == TaskStatus::InProgress {
                    task.started_at.get_or_insert_with(Utc::now);
                }
                task.status = new_status;
            }
            TaskStatus::Completed => {
                return Err(ConductorError::Orchestrator(format!(
                    "completion of {task_id} must go through complete_task"
                )))
            }
        }

        let status = task.status;
        let mut touched = vec![task_id.to_string()];
        if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
            table.resolve(task_id);
        }
        let cascaded = if old_status != status {
            table.cascade(task_id)
        } else {
            Vec::new()
        };
        let status = table.get(task_id).map(|t| t.status).unwrap_or(status);
        let outcome = MessageOutcome {
            task_id: task_id.to_string(),
            status,
            cascaded: cascaded.len(),
            conflicts: Vec::new(),
        };
        touched.extend(cascaded);
        Ok((outcome, touched))
    }

    fn apply_checkpoint(
        &self,
        message: &AgentMessage,
    ) -> ConductorResult<(MessageOutcome, Vec<TaskId>)> {
        let task_id = message.task_id.as_str();
        let progress = message.progress.unwrap_or(0).min(100);
        let status = {
            let mut table = self.tasks.lock();
            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if !task.is_completed() {
                task.progress = progress;
            }
            task.status
        };
        self.checkpoints.lock().push(Checkpoint {
            agent_id: message.agent_id.clone(),
            task_id: task_id.to_string(),
            progress,
            changes_summary: message.message.clone().unwrap_or_default(),
            next_steps: message.next_steps.clone().unwrap_or_default(),
            timestamp: message.timestamp,
        });
        debug!(task_id, agent_id = %message.agent_id, progress, "Checkpoint recorded");
        Ok((
            MessageOutcome {
                task_id: task_id.to_string(),
                status,
                cascaded: 0,
                conflicts: Vec::new(),
            },
            vec![task_id.to_string()],
        ))
    }

    fn apply_dependency_request(
        &self,
        message: &AgentMessage,
    ) -> ConductorResult<(MessageOutcome, Vec<TaskId>)> {
        let task_id = message.task_id.as_str();
        let mut table = self.tasks.lock();
        let blocking = message.blocking_task.clone();

        let add_edge = blocking.as_deref().is_some_and(|dep| {
            dep != task_id && table.contains(dep) && !table.depends_transitively(dep, task_id)
        });

        let task = table
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
        if task.is_completed() {
            return Err(ConductorError::InvalidTransition(format!(
                "task {task_id} is completed and cannot be blocked"
            )));
        }
        if let (true, Some(dep)) = (add_edge, &blocking) {
            if !task.dependencies.contains(dep) {
                task.dependencies.push(dep.clone());
            }
        }
        let reason = message.message.clone().unwrap_or_else(|| match &blocking {
            Some(dep) => format!("waiting on dependencies: {dep}"),
            None => "waiting on dependencies".to_string(),
        });
        self.block(task, &reason, BlockerContext::DependencyRequest);
        info!(task_id, blocking = ?blocking, linked = add_edge, "Dependency request");

        // An unlinked request has no edge to wait on; it stays BLOCKED.
        if add_edge {
            table.resolve(task_id);
        }
        let status = table.get(task_id).map_or(TaskStatus::Blocked, |t| t.status);
        Ok((
            MessageOutcome {
                task_id: task_id.to_string(),
                status,
                cascaded: 0,
                conflicts: Vec::new(),
            },
            vec![task_id.to_string()],
        ))
    }

    /// Validate the reported artifacts and complete the task.
    ///
    /// Conflicts leave the task BLOCKED with a conflict blocker and discard
    /// the change set; a completed task is never routed back. Completing an
    /// already completed task is a no-op.
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        artifacts: Vec<String>,
    ) -> ConductorResult<MessageOutcome> {
        let (outcome, touched, busy) = {
            let mut table = self.tasks.lock();
            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if task.is_completed() {
                return Ok(MessageOutcome {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Completed,
                    cascaded: 0,
                    conflicts: Vec::new(),
                });
            }
            if task.status == TaskStatus::Failed {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} has failed and cannot be completed"
                )));
            }
            if let Some(owner) = task.assigned_agent.as_deref() {
                if owner != agent_id {
                    return Err(ConductorError::InvalidTransition(format!(
                        "task {task_id} is held by {owner}, not {agent_id}"
                    )));
                }
            }

            let mut seen = HashSet::new();
            let files: Vec<String> = artifacts
                .into_iter()
                .filter(|f| seen.insert(f.clone()))
                .collect();
            let change_set = ChangeSet::new(agent_id, task_id)
                .with_modified(files.clone())
                .with_description(task.title.clone());
            self.conflicts.register(change_set.clone());
            let conflicts = self.conflicts.validate(&change_set);
            let busy = busy_ms(task);

            if !conflicts.is_empty() {
                self.conflicts.reject(task_id);
                let reason = format!("conflict: {}", conflicts.join("; "));
                self.block(task, &reason, BlockerContext::ConflictCheck);
                (
                    MessageOutcome {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Blocked,
                        cascaded: 0,
                        conflicts,
                    },
                    vec![task_id.to_string()],
                    None,
                )
            } else {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.completed_at = Some(Utc::now());
                task.clear_blocker();
                merge_artifacts(task, &files);
                if task.assigned_agent.is_none() {
                    task.assigned_agent = Some(agent_id.to_string());
                }
                self.conflicts.integrate(&change_set);
                self.conflicts.release_task_resources(task, agent_id);

                let cascaded = table.cascade(task_id);
                let mut touched = vec![task_id.to_string()];
                touched.extend(cascaded.iter().cloned());
                (
                    MessageOutcome {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Completed,
                        cascaded: cascaded.len(),
                        conflicts: Vec::new(),
                    },
                    touched,
                    Some(busy),
                )
            }
        };

        match busy {
            Some(ms) => {
                self.monitor.record_completion(agent_id, ms);
                info!(task_id, agent_id, unblocked = outcome.cascaded, "Task completed");
            }
            None => self.monitor.record_blocked(agent_id, 0),
        }
        self.persist(touched).await;
        Ok(outcome)
    }

    /// Terminalize a task as FAILED with a readable reason.
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> ConductorResult<()> {
        {
            let mut table = self.tasks.lock();
            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if task.is_completed() {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} is completed and cannot fail"
                )));
            }
            task.set_blocker(reason, classify_blocker(reason, BlockerContext::StatusUpdate));
            task.status = TaskStatus::Failed;
            self.release_assignment(task);
        }
        warn!(task_id, "Task failed: {reason}");
        self.persist(vec![task_id.to_string()]).await;
        Ok(())
    }

    fn requeue_locked(&self, table: &mut TaskTable, task_id: &str, note: &str) -> ConductorResult<()> {
        let task = table
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
        if task.is_completed() {
            return Err(ConductorError::InvalidTransition(format!(
                "task {task_id} is completed and cannot be requeued"
            )));
        }
        self.release_assignment(task);
        task.clear_blocker();
        task.status = TaskStatus::Pending;
        task.progress = 0;
        let count = task
            .metadata
            .get("requeue_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        task.metadata
            .insert("requeue_count".into(), serde_json::Value::from(count + 1));
        task.metadata
            .insert("requeue_note".into(), serde_json::Value::from(note));
        table.resolve(task_id);
        Ok(())
    }

    /// Put a non-completed task back in line: blocker and owner cleared,
    /// then re-resolved to READY or dependency-BLOCKED.
    pub async fn requeue_task(&self, task_id: &str, note: &str) -> ConductorResult<TaskStatus> {
        let status = {
            let mut table = self.tasks.lock();
            self.requeue_locked(&mut table, task_id, note)?;
            table.get(task_id).map_or(TaskStatus::Pending, |t| t.status)
        };
        info!(task_id, status = %status, "Task requeued: {note}");
        self.persist(vec![task_id.to_string()]).await;
        Ok(status)
    }

    /// Roll back a COMPLETED task that has no evidence of real output.
    ///
    /// This is the single path out of COMPLETED and is reserved for the
    /// supervisor's spurious-completion audit.
    pub async fn revert_unverified_completion(&self, task_id: &str) -> ConductorResult<TaskStatus> {
        let (status, touched) = {
            let mut table = self.tasks.lock();
            let task = table
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
            if !task.is_completed() {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id} is {}, not completed",
                    task.status
                )));
            }
            task.status = TaskStatus::Pending;
            task.progress = 0;
            task.completed_at = None;
            task.started_at = None;
            task.assigned_agent = None;
            task.metadata.insert(
                "reverted_unverified_completion".into(),
                serde_json::Value::Bool(true),
            );
            table.resolve(task_id);
            let mut touched = vec![task_id.to_string()];
            touched.extend(table.cascade(task_id));
            let status = table.get(task_id).map_or(TaskStatus::Pending, |t| t.status);
            (status, touched)
        };
        warn!(task_id, status = %status, "Unverified completion reverted");
        self.persist(touched).await;
        Ok(status)
    }

    /// Stop an agent: state STOPPED, in-flight tasks requeued with `note`,
    /// every lease it holds released. Returns the requeued task ids.
    pub async fn stop_agent(&self, agent_id: &str, note: &str) -> ConductorResult<Vec<TaskId>> {
        let requeued = {
            let mut table = self.tasks.lock();
            let owned: Vec<TaskId> = table
                .all()
                .into_iter()
                .filter(|t| t.status.is_active() && t.assigned_agent.as_deref() == Some(agent_id))
                .map(|t| t.id.clone())
                .collect();
            for id in &owned {
                self.requeue_locked(&mut table, id, note)?;
            }
            self.conflicts.release_agent(agent_id);
            owned
        };
        self.set_agent_state(agent_id, AgentState::Stopped)?;
        warn!(agent_id, requeued = requeued.len(), "Agent stopped: {note}");
        self.persist(requeued.clone()).await;
        Ok(requeued)
    }

    /// Restore tasks already created for `original`, in creation order.
    pub fn restore_tasks_of(&self, original: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .all()
            .into_iter()
            .filter(|t| {
                t.metadata.get("restore_of").and_then(serde_json::Value::as_str) == Some(original)
            })
            .cloned()
            .collect()
    }

    /// Create `<original>-restore-<n>` to re-produce `missing` artifacts.
    pub async fn add_restore_task(
        &self,
        original: &str,
        missing: Vec<String>,
    ) -> ConductorResult<TaskId> {
        let task = {
            let table = self.tasks.lock();
            let source = table
                .get(original)
                .ok_or_else(|| ConductorError::TaskNotFound(original.to_string()))?;
            let mut n = self.restore_count(&table, original) + 1;
            while table.contains(&format!("{original}-restore-{n}")) {
                n += 1;
            }
            let mut task = Task::new(
                format!("{original}-restore-{n}"),
                format!("Restore artifacts of {}", source.title),
            )
            .with_description(format!(
                "Re-create artifacts missing from completed task {original}: {}",
                missing.join(", ")
            ))
            .with_dependencies([original])
            .with_artifacts(missing)
            .with_acceptance_criteria(source.acceptance_criteria.clone());
            task.metadata
                .insert("restore_of".into(), serde_json::Value::from(original));
            task
        };
        let id = task.id.clone();
        self.add_tasks(vec![task]).await?;
        info!(task_id = %id, original, "Restore task created");
        Ok(id)
    }

    fn restore_count(&self, table: &TaskTable, original: &str) -> usize {
        table
            .all()
            .into_iter()
            .filter(|t| {
                t.metadata.get("restore_of").and_then(serde_json::Value::as_str) == Some(original)
            })
            .count()
    }

    // ------------------------------------------------------------------
    // Logs and status
    // ------------------------------------------------------------------

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().clone()
    }

    pub fn has_completion_message(&self, task_id: &str) -> bool {
        self.messages.lock().iter().any(|m| {
            m.task_id == task_id
                && (m.kind == MessageType::Completion
                    || m.status == Some(TaskStatus::Completed))
        })
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }

    pub fn last_checkpoint(&self, task_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .rev()
            .find(|c| c.task_id == task_id)
            .cloned()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let (total_tasks, counts, ready) = {
            let table = self.tasks.lock();
            (
                table.len(),
                table.counts_by_status(),
                table
                    .with_status(TaskStatus::Ready)
                    .into_iter()
                    .map(|t| t.id.clone())
                    .collect(),
            )
        };
        let agents = self
            .agents()
            .into_iter()
            .map(|r| AgentSummary {
                id: r.id,
                kind: r.kind,
                state: r.state,
                workload: r.workload,
            })
            .collect();
        CoordinatorStatus {
            project: self.project.clone(),
            total_tasks,
            counts,
            agents,
            ready,
            conflict_prevention: self.conflicts.status(),
            generated_at: Utc::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn edit_task<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks.lock().get_mut(task_id).map(f)
    }

    #[cfg(test)]
    pub(crate) fn push_checkpoint(&self, checkpoint: Checkpoint) {
        self.checkpoints.lock().push(checkpoint);
    }
}

fn busy_ms(task: &Task) -> u64 {
    task.started_at
        .map(|s| (Utc::now() - s).num_milliseconds().max(0).unsigned_abs())
        .unwrap_or(0)
}

fn merge_artifacts(task: &mut Task, artifacts: &[String]) {
    for artifact in artifacts {
        if !task.artifacts.contains(artifact) {
            task.artifacts.push(artifact.clone());
        }
    }
}
