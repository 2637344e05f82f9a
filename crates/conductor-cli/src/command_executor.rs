use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, ExecutorConfig};
use conductor_orchestrator::{ExecutionContext, ExecutionOutcome, Task, WorkExecutor};
use std::process::Stdio;
use tracing::debug;

const ARTIFACT_PREFIX: &str = "ARTIFACT:";

/// Runs an external program once per attempt.
///
/// The task is exposed through `CONDUCTOR_*` environment variables. Exit 0 is
/// success; produced artifacts are the declared ones that exist afterwards
/// plus every `ARTIFACT: <path>` line printed on stdout.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }
}

fn reported_artifacts(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

fn last_line(text: &str) -> &str {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

#[async_trait]
impl WorkExecutor for CommandExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ConductorResult<ExecutionOutcome> {
        let task_json = serde_json::to_string(task)?;
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&ctx.workspace)
            .env("CONDUCTOR_TASK_ID", &task.id)
            .env("CONDUCTOR_TASK_TITLE", &task.title)
            .env("CONDUCTOR_TASK_DESCRIPTION", &task.description)
            .env("CONDUCTOR_TASK_ARTIFACTS", task.artifacts.join("\n"))
            .env("CONDUCTOR_TASK_DEPENDENCIES", task.dependencies.join(","))
            .env("CONDUCTOR_TASK_JSON", task_json)
            .env("CONDUCTOR_AGENT_ID", &ctx.agent_id)
            .env("CONDUCTOR_WORKSPACE", &ctx.workspace)
            .env("CONDUCTOR_SCRATCH_DIR", &ctx.scratch_dir)
            .env("CONDUCTOR_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConductorError::Executor(format!("failed to start '{}': {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            task_id = %task.id,
            program = %self.program,
            status = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "Command finished"
        );

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
            let detail = last_line(&stderr);
            let reason = if detail.is_empty() {
                format!("execution failed: {} exited with {code}", self.program)
            } else {
                format!("execution failed: {} exited with {code}: {detail}", self.program)
            };
            return Ok(ExecutionOutcome::failed(reason));
        }

        let mut artifacts: Vec<String> = task
            .artifacts
            .iter()
            .filter(|a| ctx.workspace.join(a).exists())
            .cloned()
            .collect();
        for reported in reported_artifacts(&stdout) {
            if !artifacts.contains(&reported) {
                artifacts.push(reported);
            }
        }
        let mut outcome = ExecutionOutcome::succeeded(artifacts);
        let summary = last_line(&stdout);
        if !summary.is_empty() && !summary.starts_with(ARTIFACT_PREFIX) {
            outcome.message = Some(summary.to_string());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_artifacts() {
        let out = "building\nARTIFACT: src/a.rs\n  ARTIFACT:   docs/b.md \nARTIFACT:\ndone\n";
        assert_eq!(reported_artifacts(out), vec!["src/a.rs", "docs/b.md"]);
    }

    #[test]
    fn test_from_config_requires_program() {
        assert!(CommandExecutor::from_config(&ExecutorConfig::default()).is_none());
        let config = ExecutorConfig {
            program: Some("make".into()),
            args: vec!["all".into()],
        };
        let exec = CommandExecutor::from_config(&config).unwrap();
        assert_eq!(exec.program, "make");
        assert_eq!(exec.args, vec!["all"]);
    }

    #[cfg(unix)]
    fn context(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext {
            agent_id: "general-1".into(),
            workspace: dir.to_path_buf(),
            scratch_dir: dir.join(".conductor/agents/general-1"),
            attempt: 1,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_collects_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                "printf %s \"$CONDUCTOR_TASK_ID\" > declared.txt; echo 'ARTIFACT: extra.txt'".into(),
            ],
        );
        let task = Task::new("t-1", "Write").with_artifacts(["declared.txt", "never.txt"]);
        let outcome = exec.execute(&task, &context(dir.path())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.artifacts, vec!["declared.txt", "extra.txt"]);
        let written = std::fs::read_to_string(dir.path().join("declared.txt")).unwrap();
        assert_eq!(written, "t-1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "echo 'tests failed' >&2; exit 3".into()]);
        let outcome = exec
            .execute(&Task::new("t-1", "Fail"), &context(dir.path()))
            .await
            .unwrap();
        assert!(!outcome.success);
        let reason = outcome.message.unwrap();
        assert!(reason.contains("status 3"));
        assert!(reason.ends_with("tests failed"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("conductor-no-such-program", Vec::new());
        let err = exec
            .execute(
                &Task::new("t-1", "Missing"),
                &ExecutionContext {
                    agent_id: "a".into(),
                    workspace: dir.path().to_path_buf(),
                    scratch_dir: dir.path().to_path_buf(),
                    attempt: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Executor(_)));
    }
}
