use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque, unique task identifier as found in the task store.
pub type TaskId = String;

/// Status of a task in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    InProgress,
    Blocked,
    Review,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// COMPLETED or FAILED.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Owned by an agent right now.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Counts as done for the purpose of unblocking dependents.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Review)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Review => write!(f, "review"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task is BLOCKED, independent of its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockerType {
    /// Unmet or missing prerequisite task.
    Dependency,
    /// The executor ran but the result failed validation.
    Acceptance,
    /// Missing external toolchain or capability.
    Environment,
    /// Resource contention with other work.
    Conflict,
    Unknown,
}

impl std::fmt::Display for BlockerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockerType::Dependency => write!(f, "dependency"),
            BlockerType::Acceptance => write!(f, "acceptance"),
            BlockerType::Environment => write!(f, "environment"),
            BlockerType::Conflict => write!(f, "conflict"),
            BlockerType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Repeat counter for one blocker signature, used by retry budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub kind: BlockerType,
    /// Normalized blocker text; a different signature restarts the count.
    pub signature: String,
    /// How many times this signature has blocked the task.
    pub count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// A unit of work in the shared task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Resource identifiers (workspace-relative paths) this task produces.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub blocker_message: Option<String>,
    #[serde(default)]
    pub blocker_type: Option<BlockerType>,
    #[serde(default)]
    pub retry: Option<RetryState>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Fields written by other tools; carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            dependencies: Vec::new(),
            estimated_hours: None,
            status: TaskStatus::Pending,
            progress: 0,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            acceptance_criteria: Vec::new(),
            artifacts: Vec::new(),
            blocker_message: None,
            blocker_type: None,
            retry: None,
            metadata: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimated_hours = Some(hours);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn set_blocker(&mut self, message: impl Into<String>, kind: BlockerType) {
        self.blocker_message = Some(message.into());
        self.blocker_type = Some(kind);
    }

    pub fn clear_blocker(&mut self) {
        self.blocker_message = None;
        self.blocker_type = None;
    }

    /// Repeat count of the current blocker signature (0 when never blocked).
    pub fn retry_count(&self) -> u32 {
        self.retry.as_ref().map(|r| r.count).unwrap_or(0)
    }

    /// True when both tasks declare at least one common artifact.
    pub fn shares_artifacts_with(&self, other: &Task) -> bool {
        self.artifacts.iter().any(|a| other.artifacts.contains(a))
    }
}

/// Kind of event an agent reports to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    StatusUpdate,
    Checkpoint,
    DependencyRequest,
    Completion,
}

/// A one-shot event sent by an agent and consumed by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub kind: MessageType,
    pub agent_id: String,
    pub task_id: TaskId,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// For checkpoints: what the agent plans to do next.
    #[serde(default)]
    pub next_steps: Option<String>,
    /// For dependency requests: the task the sender is waiting on.
    #[serde(default)]
    pub blocking_task: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    fn base(kind: MessageType, agent_id: &str, task_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            status: None,
            progress: None,
            message: None,
            artifacts: Vec::new(),
            next_steps: None,
            blocking_task: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status_update(
        agent_id: &str,
        task_id: &str,
        status: TaskStatus,
        progress: Option<u8>,
        message: Option<String>,
    ) -> Self {
        let mut msg = Self::base(MessageType::StatusUpdate, agent_id, task_id);
        msg.status = Some(status);
        msg.progress = progress;
        msg.message = message;
        msg
    }

    pub fn checkpoint(
        agent_id: &str,
        task_id: &str,
        progress: u8,
        changes: impl Into<String>,
        next_steps: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(MessageType::Checkpoint, agent_id, task_id);
        msg.progress = Some(progress);
        msg.message = Some(changes.into());
        msg.next_steps = Some(next_steps.into());
        msg
    }

    pub fn dependency_request(
        agent_id: &str,
        task_id: &str,
        blocking_task: &str,
        message: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(MessageType::DependencyRequest, agent_id, task_id);
        msg.status = Some(TaskStatus::Blocked);
        msg.blocking_task = Some(blocking_task.to_string());
        msg.message = Some(message.into());
        msg
    }

    pub fn completion(agent_id: &str, task_id: &str, artifacts: Vec<String>) -> Self {
        let mut msg = Self::base(MessageType::Completion, agent_id, task_id);
        msg.status = Some(TaskStatus::Completed);
        msg.progress = Some(100);
        msg.artifacts = artifacts;
        msg
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Append-only progress record; never authoritative task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent_id: String,
    pub task_id: TaskId,
    pub progress: u8,
    pub changes_summary: String,
    pub next_steps: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of an agent as recorded by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Started,
    Running,
    Paused,
    Stopped,
    Error,
}

impl AgentState {
    /// Expected to be heartbeating.
    pub fn is_live(self) -> bool {
        matches!(self, AgentState::Started | AgentState::Running)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Created => write!(f, "created"),
            AgentState::Started => write!(f, "started"),
            AgentState::Running => write!(f, "running"),
            AgentState::Paused => write!(f, "paused"),
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// The variants behind the common [`crate::agent::Agent`] interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentKind {
    /// Claims and executes tasks; `specialization` selects the spawn factory.
    Worker { specialization: String },
    /// Audits the task table; never executes tasks.
    Supervisor,
}

impl AgentKind {
    pub fn worker(specialization: impl Into<String>) -> Self {
        AgentKind::Worker {
            specialization: specialization.into(),
        }
    }

    pub fn specialization(&self) -> Option<&str> {
        match self {
            AgentKind::Worker { specialization } => Some(specialization),
            AgentKind::Supervisor => None,
        }
    }
}

/// Coordinator-side registry entry for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub kind: AgentKind,
    pub state: AgentState,
    /// Tasks currently ASSIGNED or IN_PROGRESS under this agent.
    pub workload: usize,
    pub registered_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}
