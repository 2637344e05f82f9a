use crate::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, usually read from `conductor.toml`.
///
/// Every section is optional; omitted keys fall back to the defaults the
/// engine was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Project name shown in status snapshots.
    #[serde(default = "default_project")]
    pub project: String,
    /// Root of the shared workspace agents write into.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub conflicts: ConflictsConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Agent runtime loop settings and the pools to spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Idle poll interval while waiting for a READY task.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum spacing between two heartbeats of the same agent.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Upper bound for a single executor attempt.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_pools")]
    pub pools: Vec<AgentPoolConfig>,
}

/// A group of identical agents sharing one specialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPoolConfig {
    pub specialization: String,
    #[serde(default = "default_pool_count")]
    pub count: usize,
}

/// Thresholds and budgets for the supervisor audit loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    /// IN_PROGRESS tasks without checkpoint activity for this long are investigated.
    #[serde(default = "default_stale_task_secs")]
    pub stale_task_secs: u64,
    /// Reset a stuck task whose last checkpoint is older than this.
    #[serde(default = "default_no_checkpoint_reset_secs")]
    pub no_checkpoint_reset_secs: u64,
    /// Reset a task that has been in flight longer than this.
    #[serde(default = "default_max_in_flight_secs")]
    pub max_in_flight_secs: u64,
    /// Heartbeat age after which a running agent is considered unresponsive.
    #[serde(default = "default_unresponsive_agent_secs")]
    pub unresponsive_agent_secs: u64,
    /// Maximum repeats of one blocker signature that are still retried.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Minimum wait before an environment blocker is retried.
    #[serde(default = "default_environment_cooldown_secs")]
    pub environment_cooldown_secs: u64,
    /// Completions younger than this count as recent evidence of real work.
    #[serde(default = "default_recent_completion_secs")]
    pub recent_completion_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictsConfig {
    /// Let a later task overwrite files of an already-integrated task.
    #[serde(default = "default_true")]
    pub allow_completed_updates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
}

/// External program used by the CLI to perform a task's work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_project() -> String {
    "conductor".to_string()
}
fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_task_timeout_secs() -> u64 {
    1800
}
fn default_pool_count() -> usize {
    1
}
fn default_pools() -> Vec<AgentPoolConfig> {
    vec![AgentPoolConfig {
        specialization: "general".to_string(),
        count: 2,
    }]
}
fn default_audit_interval_secs() -> u64 {
    30
}
fn default_stale_task_secs() -> u64 {
    180
}
fn default_no_checkpoint_reset_secs() -> u64 {
    3600
}
fn default_max_in_flight_secs() -> u64 {
    6 * 3600
}
fn default_unresponsive_agent_secs() -> u64 {
    60
}
fn default_retry_budget() -> u32 {
    2
}
fn default_environment_cooldown_secs() -> u64 {
    300
}
fn default_recent_completion_secs() -> u64 {
    900
}
fn default_lock_ttl_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}
fn default_rebalance_interval_ms() -> u64 {
    2000
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            pools: default_pools(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            audit_interval_secs: default_audit_interval_secs(),
            stale_task_secs: default_stale_task_secs(),
            no_checkpoint_reset_secs: default_no_checkpoint_reset_secs(),
            max_in_flight_secs: default_max_in_flight_secs(),
            unresponsive_agent_secs: default_unresponsive_agent_secs(),
            retry_budget: default_retry_budget(),
            environment_cooldown_secs: default_environment_cooldown_secs(),
            recent_completion_secs: default_recent_completion_secs(),
        }
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            allow_completed_updates: true,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_ms: default_rebalance_interval_ms(),
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            workspace: default_workspace(),
            agents: AgentsConfig::default(),
            supervisor: SupervisorConfig::default(),
            locks: LocksConfig::default(),
            conflicts: ConflictsConfig::default(),
            optimizer: OptimizerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Ten years; anything above is almost certainly a unit mistake.
const MAX_SECS: u64 = 10 * 365 * 24 * 3600;

impl ConductorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file at `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.agents.poll_interval_ms == 0 {
            return Err(ConductorError::Config(
                "agents.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.supervisor.audit_interval_secs == 0 {
            return Err(ConductorError::Config(
                "supervisor.audit_interval_secs must be greater than zero".into(),
            ));
        }
        if self.optimizer.rebalance_interval_ms == 0 {
            return Err(ConductorError::Config(
                "optimizer.rebalance_interval_ms must be greater than zero".into(),
            ));
        }
        for pool in &self.agents.pools {
            if pool.specialization.trim().is_empty() {
                return Err(ConductorError::Config(
                    "agents.pools entries need a specialization".into(),
                ));
            }
        }
        let bounded = [
            ("agents.heartbeat_interval_secs", self.agents.heartbeat_interval_secs),
            ("agents.task_timeout_secs", self.agents.task_timeout_secs),
            ("supervisor.audit_interval_secs", self.supervisor.audit_interval_secs),
            ("supervisor.stale_task_secs", self.supervisor.stale_task_secs),
            (
                "supervisor.no_checkpoint_reset_secs",
                self.supervisor.no_checkpoint_reset_secs,
            ),
            ("supervisor.max_in_flight_secs", self.supervisor.max_in_flight_secs),
            (
                "supervisor.unresponsive_agent_secs",
                self.supervisor.unresponsive_agent_secs,
            ),
            (
                "supervisor.environment_cooldown_secs",
                self.supervisor.environment_cooldown_secs,
            ),
            (
                "supervisor.recent_completion_secs",
                self.supervisor.recent_completion_secs,
            ),
            ("locks.default_ttl_secs", self.locks.default_ttl_secs),
        ];
        for (name, value) in bounded {
            if value > MAX_SECS {
                return Err(ConductorError::Config(format!(
                    "{name} is out of range ({value} > {MAX_SECS})"
                )));
            }
        }
        Ok(())
    }

    /// Total number of worker agents across all pools.
    pub fn total_agents(&self) -> usize {
        self.agents.pools.iter().map(|p| p.count).sum()
    }
}

impl AgentsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl SupervisorConfig {
    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }
}

impl OptimizerConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ConductorConfig::from_toml_str("").unwrap();
        assert_eq!(config.project, "conductor");
        assert_eq!(config.supervisor.audit_interval_secs, 30);
        assert_eq!(config.supervisor.stale_task_secs, 180);
        assert_eq!(config.supervisor.unresponsive_agent_secs, 60);
        assert_eq!(config.supervisor.retry_budget, 2);
        assert_eq!(config.supervisor.environment_cooldown_secs, 300);
        assert!(config.conflicts.allow_completed_updates);
        assert_eq!(config.total_agents(), 2);
    }

    #[test]
    fn test_partial_document() {
        let raw = r#"
            project = "site-rebuild"

            [supervisor]
            audit_interval_secs = 5
            retry_budget = 3

            [conflicts]
            allow_completed_updates = false

            [[agents.pools]]
            specialization = "backend"
            count = 3

            [[agents.pools]]
            specialization = "frontend"
        "#;
        let config = ConductorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.project, "site-rebuild");
        assert_eq!(config.supervisor.audit_interval_secs, 5);
        assert_eq!(config.supervisor.retry_budget, 3);
        assert_eq!(config.supervisor.stale_task_secs, 180);
        assert!(!config.conflicts.allow_completed_updates);
        assert_eq!(config.agents.pools.len(), 2);
        assert_eq!(config.agents.pools[1].count, 1);
        assert_eq!(config.total_agents(), 4);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = ConductorConfig::from_toml_str("[agents]\npoll_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let err = ConductorConfig::from_toml_str("[locks]\ndefault_ttl_secs = 999999999999")
            .unwrap_err();
        assert!(err.to_string().contains("locks.default_ttl_secs"));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ConductorConfig::from_toml_str("project = ").unwrap_err();
        assert!(matches!(err, ConductorError::Toml(_)));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConductorConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.locks.default_ttl_secs, 1800);
    }

    #[test]
    fn test_load_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conductor.toml");
        std::fs::write(&path, "workspace = \"/srv/work\"\n[optimizer]\nrebalance_interval_ms = 250\n")
            .unwrap();
        let config = ConductorConfig::load(&path).unwrap();
        assert_eq!(config.workspace, PathBuf::from("/srv/work"));
        assert_eq!(config.optimizer.rebalance_interval(), Duration::from_millis(250));
    }
}
