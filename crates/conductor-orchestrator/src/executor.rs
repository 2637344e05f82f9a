use crate::types::Task;
use async_trait::async_trait;
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What an executor gets to know about the attempt besides the task.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent_id: String,
    /// Shared project workspace.
    pub workspace: PathBuf,
    /// The agent's private scratch directory.
    pub scratch_dir: PathBuf,
    /// 1-based attempt number for this task.
    pub attempt: u32,
}

/// Result of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Readable reason on failure, optional summary on success.
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(artifacts: Vec<String>) -> Self {
        Self {
            success: true,
            artifacts,
            message: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            message: Some(reason.into()),
        }
    }
}

/// Produces the actual work for a task. Called exactly once per attempt.
///
/// An `Err` is reported as an execution failure; a failed outcome carries the
/// executor's own reason.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext)
        -> ConductorResult<ExecutionOutcome>;
}
