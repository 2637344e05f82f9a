//! Conflict prevention: resource leases, change-set validation, rollback
//! records and per-agent scratch workspaces behind one facade.

use crate::locks::{LockManager, LockType, ResourceLock};
use crate::types::{Task, TaskId};
use chrono::{DateTime, Duration, Utc};
use conductor_core::{ConductorConfig, ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files a task touched, recorded when it reports completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub agent_id: String,
    pub task_id: TaskId,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_deleted: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl ChangeSet {
    pub fn new(agent_id: &str, task_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            files_deleted: Vec::new(),
            description: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_modified(mut self, files: Vec<String>) -> Self {
        self.files_modified = files;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Every file in the set, deduplicated and sorted.
    pub fn files(&self) -> BTreeSet<&str> {
        self.files_modified
            .iter()
            .chain(&self.files_created)
            .chain(&self.files_deleted)
            .map(String::as_str)
            .collect()
    }
}

#[derive(Default)]
struct DetectorState {
    pending: HashMap<TaskId, ChangeSet>,
    integrated: Vec<ChangeSet>,
}

/// Tracks pending and integrated change sets and reports overlapping writes.
#[derive(Default)]
pub struct ConflictDetector {
    state: Mutex<DetectorState>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending change set, replacing any earlier one for the task.
    pub fn record(&self, change_set: ChangeSet) {
        let mut state = self.state.lock();
        state.pending.insert(change_set.task_id.clone(), change_set);
    }

    /// Conflicts between `change_set` and the rest of the history.
    ///
    /// Pending sets of other tasks are always checked; integrated sets only when
    /// `allow_completed_updates` is off.
    pub fn validate(&self, change_set: &ChangeSet, allow_completed_updates: bool) -> Vec<String> {
        let files = change_set.files();
        let state = self.state.lock();
        let mut conflicts = Vec::new();

        if !allow_completed_updates {
            for other in state
                .integrated
                .iter()
                .filter(|o| o.task_id != change_set.task_id)
            {
                for file in other.files().intersection(&files) {
                    conflicts.push(format!(
                        "{file} conflicts with integrated task {}",
                        other.task_id
                    ));
                }
            }
        }

        let mut pending: Vec<&ChangeSet> = state
            .pending
            .values()
            .filter(|o| o.task_id != change_set.task_id)
            .collect();
        pending.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        for other in pending {
            for file in other.files().intersection(&files) {
                conflicts.push(format!(
                    "{file} is modified by pending task {} ({})",
                    other.task_id, other.agent_id
                ));
            }
        }
        conflicts
    }

    /// Move the task's pending set into the baseline.
    pub fn mark_integrated(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.pending.remove(task_id) {
            Some(set) => {
                state.integrated.push(set);
                true
            }
            None => false,
        }
    }

    /// Drop a rejected pending set.
    pub fn discard(&self, task_id: &str) -> bool {
        self.state.lock().pending.remove(task_id).is_some()
    }

    pub fn integrated(&self) -> Vec<ChangeSet> {
        self.state.lock().integrated.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn integrated_count(&self) -> usize {
        self.state.lock().integrated.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Modified,
    Deleted,
    LockAcquired,
}

/// One reversible step of an [`AtomicOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub resource: String,
    pub action: ChangeAction,
    /// Prior content for modifications and deletions, when the caller kept it.
    #[serde(default)]
    pub previous: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Ordered reversible change records. Undoing them is the caller's job;
/// this type only guarantees that rollback and commit are exclusive.
#[derive(Debug, Default)]
pub struct AtomicOperation {
    records: Vec<ChangeRecord>,
    committed: bool,
}

impl AtomicOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: impl Into<String>, action: ChangeAction, previous: Option<String>) {
        self.records.push(ChangeRecord {
            resource: resource.into(),
            action,
            previous,
            recorded_at: Utc::now(),
        });
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Hand back the records newest first. Fails once committed.
    pub fn rollback(&mut self) -> ConductorResult<Vec<ChangeRecord>> {
        if self.committed {
            return Err(ConductorError::Conflict(
                "cannot roll back a committed operation".into(),
            ));
        }
        let mut records = std::mem::take(&mut self.records);
        records.reverse();
        Ok(records)
    }
}

/// Private scratch directories, one per agent, under the shared workspace.
pub struct WorkspaceIsolation {
    root: PathBuf,
    prepared: Mutex<HashSet<String>>,
}

impl WorkspaceIsolation {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            root: workspace.as_ref().join(".conductor").join("agents"),
            prepared: Mutex::new(HashSet::new()),
        }
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id)
    }

    /// Create the agent's directory if needed and return its path.
    pub async fn prepare(&self, agent_id: &str) -> ConductorResult<PathBuf> {
        let path = self.path_for(agent_id);
        tokio::fs::create_dir_all(&path).await?;
        if self.prepared.lock().insert(agent_id.to_string()) {
            debug!(agent_id, path = %path.display(), "Isolated workspace ready");
        }
        Ok(path)
    }

    pub fn count(&self) -> usize {
        self.prepared.lock().len()
    }
}

/// Serializable summary for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPreventionStatus {
    pub active_locks: usize,
    pub pending_change_sets: usize,
    pub integrated_change_sets: usize,
    pub isolated_workspaces: usize,
    pub allow_completed_updates: bool,
    pub locks: Vec<ResourceLock>,
}

/// The single entry point the coordinator consults before assignment and
/// completion.
pub struct ConflictPrevention {
    locks: LockManager,
    detector: ConflictDetector,
    workspaces: WorkspaceIsolation,
    allow_completed_updates: bool,
}

impl ConflictPrevention {
    pub fn new(
        workspace: impl AsRef<Path>,
        default_ttl: Duration,
        allow_completed_updates: bool,
    ) -> Self {
        Self {
            locks: LockManager::new(default_ttl),
            detector: ConflictDetector::new(),
            workspaces: WorkspaceIsolation::new(workspace),
            allow_completed_updates,
        }
    }

    pub fn from_config(config: &ConductorConfig) -> Self {
        Self::new(
            &config.workspace,
            crate::secs(config.locks.default_ttl_secs),
            config.conflicts.allow_completed_updates,
        )
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn workspaces(&self) -> &WorkspaceIsolation {
        &self.workspaces
    }

    /// Refuse when another agent holds a writer lease on any declared artifact.
    pub fn check_assignment(&self, task: &Task, agent_id: &str) -> Result<(), String> {
        for artifact in &task.artifacts {
            if let Some(holder) = self.locks.writer_other_than(artifact, agent_id) {
                return Err(format!("{artifact} is locked by {holder}"));
            }
        }
        Ok(())
    }

    /// Take exclusive leases on every declared artifact, all or nothing.
    pub fn claim_resources(&self, task: &Task, agent_id: &str) -> ConductorResult<()> {
        let mut op = AtomicOperation::new();
        for artifact in &task.artifacts {
            match self.locks.acquire(artifact, agent_id, LockType::Exclusive, None) {
                Ok(_) => op.record(artifact.clone(), ChangeAction::LockAcquired, None),
                Err(e) => {
                    for record in op.rollback()? {
                        self.locks.release(&record.resource, agent_id);
                    }
                    warn!(task_id = %task.id, agent_id, error = %e, "Resource claim rolled back");
                    return Err(ConductorError::Conflict(e.to_string()));
                }
            }
        }
        op.commit();
        Ok(())
    }

    /// Release the leases `agent_id` holds on the task's declared artifacts.
    pub fn release_task_resources(&self, task: &Task, agent_id: &str) -> usize {
        task.artifacts
            .iter()
            .filter(|a| self.locks.release(a, agent_id))
            .count()
    }

    pub fn release_agent(&self, agent_id: &str) -> usize {
        self.locks.release_all(agent_id)
    }

    pub fn register(&self, change_set: ChangeSet) {
        self.detector.record(change_set);
    }

    pub fn validate(&self, change_set: &ChangeSet) -> Vec<String> {
        self.detector.validate(change_set, self.allow_completed_updates)
    }

    /// Make the set the new baseline and drop the agent's leases on its files.
    pub fn integrate(&self, change_set: &ChangeSet) {
        self.detector.mark_integrated(&change_set.task_id);
        for file in change_set.files() {
            self.locks.release(file, &change_set.agent_id);
        }
        info!(
            task_id = %change_set.task_id,
            files = change_set.files().len(),
            "Change set integrated"
        );
    }

    pub fn reject(&self, task_id: &str) {
        self.detector.discard(task_id);
    }

    /// Integrated change sets whose files all still exist under `workspace`.
    pub fn has_verified_output(&self, workspace: &Path) -> bool {
        self.detector.integrated().iter().any(|set| {
            let files = set.files();
            !files.is_empty() && files.iter().all(|f| workspace.join(f).exists())
        })
    }

    pub fn status(&self) -> ConflictPreventionStatus {
        let locks = self.locks.active_locks();
        ConflictPreventionStatus {
            active_locks: locks.len(),
            pending_change_sets: self.detector.pending_count(),
            integrated_change_sets: self.detector.integrated_count(),
            isolated_workspaces: self.workspaces.count(),
            allow_completed_updates: self.allow_completed_updates,
            locks,
        }
    }
}
