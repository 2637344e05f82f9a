use crate::types::{AgentState, TaskId};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counters accumulated per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_blocked: u64,
    pub errors: u64,
    pub busy_ms: u64,
}

/// Liveness record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub task_id: Option<TaskId>,
    pub state: Option<AgentState>,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: AgentMetrics,
}

/// Heartbeat channel and per-agent metrics. Read by the supervisor's
/// unresponsive-agent audit.
pub struct AgentMonitor {
    agents: RwLock<HashMap<String, AgentHealth>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn with_entry(&self, agent_id: &str, f: impl FnOnce(&mut AgentHealth)) {
        let mut agents = self.agents.write();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentHealth {
                agent_id: agent_id.to_string(),
                task_id: None,
                state: None,
                last_heartbeat: Utc::now(),
                metrics: AgentMetrics::default(),
            });
        f(entry);
    }

    /// Record a heartbeat. `task_id` and `state` overwrite the previous values.
    pub fn record_heartbeat(&self, agent_id: &str, task_id: Option<&str>, state: Option<AgentState>) {
        self.with_entry(agent_id, |h| {
            h.last_heartbeat = Utc::now();
            h.task_id = task_id.map(str::to_string);
            if state.is_some() {
                h.state = state;
            }
        });
    }

    pub fn record_completion(&self, agent_id: &str, busy_ms: u64) {
        self.with_entry(agent_id, |h| {
            h.metrics.tasks_completed += 1;
            h.metrics.busy_ms += busy_ms;
        });
    }

    pub fn record_blocked(&self, agent_id: &str, busy_ms: u64) {
        self.with_entry(agent_id, |h| {
            h.metrics.tasks_blocked += 1;
            h.metrics.busy_ms += busy_ms;
        });
    }

    pub fn record_error(&self, agent_id: &str) {
        self.with_entry(agent_id, |h| h.metrics.errors += 1);
    }

    pub fn last_heartbeat(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.agents.read().get(agent_id).map(|h| h.last_heartbeat)
    }

    /// Agents whose last heartbeat is older than `threshold`.
    pub fn stale_agents(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now() - threshold;
        let mut stale: Vec<String> = self
            .agents
            .read()
            .values()
            .filter(|h| h.last_heartbeat < cutoff)
            .map(|h| h.agent_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn forget(&self, agent_id: &str) {
        self.agents.write().remove(agent_id);
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentHealth> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Get a snapshot of all agents, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentHealth> {
        let mut all: Vec<AgentHealth> = self.agents.read().values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub fn aggregate_metrics(&self) -> AgentMetrics {
        let agents = self.agents.read();
        let mut total = AgentMetrics::default();
        for h in agents.values() {
            total.tasks_completed += h.metrics.tasks_completed;
            total.tasks_blocked += h.metrics.tasks_blocked;
            total.errors += h.metrics.errors;
            total.busy_ms += h.metrics.busy_ms;
        }
        total
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.snapshot(),
            "aggregate": self.aggregate_metrics(),
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, agent_id: &str, by: Duration) {
        self.with_entry(agent_id, |h| h.last_heartbeat = h.last_heartbeat - by);
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_updates_state() {
        let monitor = AgentMonitor::new();
        monitor.record_heartbeat("agent-1", Some("t-1"), Some(AgentState::Running));
        let h = monitor.get("agent-1").unwrap();
        assert_eq!(h.task_id.as_deref(), Some("t-1"));
        assert_eq!(h.state, Some(AgentState::Running));

        monitor.record_heartbeat("agent-1", None, None);
        let h = monitor.get("agent-1").unwrap();
        assert!(h.task_id.is_none());
        assert_eq!(h.state, Some(AgentState::Running));
    }

    #[test]
    fn test_stale_agents() {
        let monitor = AgentMonitor::new();
        monitor.record_heartbeat("fresh", None, None);
        monitor.record_heartbeat("old", None, None);
        monitor.backdate("old", Duration::seconds(120));
        assert_eq!(monitor.stale_agents(Duration::seconds(60)), vec!["old"]);

        monitor.forget("old");
        assert!(monitor.stale_agents(Duration::seconds(60)).is_empty());
    }

    #[test]
    fn test_metrics_aggregate() {
        let monitor = AgentMonitor::new();
        monitor.record_completion("a", 1_000);
        monitor.record_completion("a", 500);
        monitor.record_blocked("b", 250);
        monitor.record_error("b");

        let a = monitor.get("a").unwrap();
        assert_eq!(a.metrics.tasks_completed, 2);
        assert_eq!(a.metrics.busy_ms, 1_500);

        let agg = monitor.aggregate_metrics();
        assert_eq!(agg.tasks_completed, 2);
        assert_eq!(agg.tasks_blocked, 1);
        assert_eq!(agg.errors, 1);
        assert_eq!(agg.busy_ms, 1_750);
    }

    #[test]
    fn test_to_json() {
        let monitor = AgentMonitor::new();
        monitor.record_heartbeat("agent-1", None, Some(AgentState::Started));
        let json = monitor.to_json();
        assert!(json["agents"].is_array());
        assert_eq!(json["agents"][0]["state"], "started");
        assert!(json["aggregate"].is_object());
    }
}
