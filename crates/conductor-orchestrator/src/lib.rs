//! Multi-agent task orchestration: a shared task table driven by worker
//! loops, guarded by resource locks, audited by a supervisor.
//!
//! Agents pull READY work from the [`Coordinator`], which consults conflict
//! prevention and the dependency graph before assigning. Results come back as
//! [`AgentMessage`]s and completions cascade to dependents before the call
//! returns. The [`Supervisor`] repairs stuck or inconsistent state out of band
//! and the [`ParallelOptimizer`] hands newly READY tasks to idle workers.
//!
//! # Main types
//!
//! - [`Coordinator`]: Owns the task table and agent registry.
//! - [`TaskTable`]: Task state machine and dependency resolution.
//! - [`ConflictPrevention`]: Lock manager, change-set detector and workspace isolation.
//! - [`WorkerAgent`]: Runtime loop executing tasks through a [`WorkExecutor`].
//! - [`Supervisor`]: Audit pass with bounded corrective actions and deadlock breakers.
//! - [`ParallelOptimizer`]: Dependency levels, parallel groups and idle-agent assignment.
//! - [`AgentSpawner`]: Spawn factories by specialization.
//! - [`TaskStore`]: Persistence seam, with memory and JSON file implementations.

/// Common agent interface and the worker runtime loop.
pub mod agent;
/// Text-based blocker classification and signatures.
pub mod blocker;
/// Locks, change-set validation, atomic operations and workspace isolation.
pub mod conflicts;
/// Central coordinator over tasks and agents.
pub mod coordinator;
/// Work executor seam.
pub mod executor;
/// Resource lock manager.
pub mod locks;
/// Heartbeats and per-agent metrics.
pub mod monitor;
/// Dependency levels and idle-agent scheduling.
pub mod optimizer;
/// Agent spawn factories.
pub mod spawner;
/// Task persistence.
pub mod store;
/// Supervisor audit loop.
pub mod supervisor;
/// Task table and dependency resolver.
pub mod task_table;
/// Shared orchestration types.
pub mod types;

pub use agent::{Agent, AgentControl, WorkerAgent, WorkerSettings};
pub use blocker::{blocker_signature, classify_blocker, BlockerContext};
pub use conflicts::{
    AtomicOperation, ChangeAction, ChangeRecord, ChangeSet, ConflictDetector, ConflictPrevention,
    ConflictPreventionStatus, WorkspaceIsolation,
};
pub use coordinator::{AgentSummary, Coordinator, CoordinatorStatus, MessageOutcome};
pub use executor::{ExecutionContext, ExecutionOutcome, WorkExecutor};
pub use locks::{LockManager, LockType, ResourceLock};
pub use monitor::{AgentHealth, AgentMetrics, AgentMonitor};
pub use optimizer::{compute_levels, parallel_groups, ParallelGroup, ParallelMetrics, ParallelOptimizer};
pub use spawner::{AgentSpawner, SpawnFactory, SpawnRequest};
pub use store::{JsonFileTaskStore, MemoryTaskStore, TaskStore};
pub use supervisor::{
    ArtifactProbe, AuditReport, Breaker, FixAction, FsArtifactProbe, Issue, IssueKind, Supervisor,
    SupervisorSettings,
};
pub use task_table::TaskTable;
pub use types::{
    AgentKind, AgentMessage, AgentRecord, AgentState, BlockerType, Checkpoint, MessageType,
    RetryState, Task, TaskId, TaskStatus,
};

/// Ten years, the cap for configured durations.
const MAX_DURATION_SECS: u64 = 315_360_000;

/// Config seconds as a chrono duration, clamped to a sane maximum.
pub(crate) fn secs(value: u64) -> chrono::Duration {
    let clamped = value.min(MAX_DURATION_SECS);
    chrono::Duration::seconds(i64::try_from(clamped).unwrap_or(0))
}
