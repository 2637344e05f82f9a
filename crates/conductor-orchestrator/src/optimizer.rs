use crate::coordinator::Coordinator;
use crate::types::{AgentKind, AgentState, Task, TaskId, TaskStatus};
use conductor_core::{ConductorConfig, ConductorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Tasks on one level that share the same transitive prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub level: usize,
    pub prerequisites: Vec<TaskId>,
    pub tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParallelMetrics {
    /// ASSIGNED plus IN_PROGRESS.
    pub current_parallel: usize,
    /// Size of the largest level.
    pub theoretical_max: usize,
    pub efficiency: f64,
    pub levels: usize,
}

/// `0` without dependencies, else `1 + max(level(dep))`.
///
/// Dependencies missing from `tasks` contribute nothing; a back edge is
/// treated the same way so cyclic input still terminates.
pub fn compute_levels(tasks: &[Task]) -> BTreeMap<TaskId, usize> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut visiting: HashSet<&str> = HashSet::new();
    for task in tasks {
        level_of(&task.id, &by_id, &mut levels, &mut visiting);
    }
    levels
        .into_iter()
        .map(|(id, level)| (id.to_string(), level))
        .collect()
}

fn level_of<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Task>,
    levels: &mut HashMap<&'a str, usize>,
    visiting: &mut HashSet<&'a str>,
) -> Option<usize> {
    if let Some(level) = levels.get(id) {
        return Some(*level);
    }
    let task = by_id.get(id)?;
    if !visiting.insert(id) {
        return None;
    }
    let level = task
        .dependencies
        .iter()
        .filter_map(|dep| level_of(dep, by_id, levels, visiting))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
    visiting.remove(id);
    levels.insert(id, level);
    Some(level)
}

/// Every known task `id` depends on, directly or not.
fn prerequisites<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Task>,
    memo: &mut HashMap<&'a str, BTreeSet<&'a str>>,
    visiting: &mut HashSet<&'a str>,
) -> BTreeSet<&'a str> {
    if let Some(set) = memo.get(id) {
        return set.clone();
    }
    let mut set = BTreeSet::new();
    let Some(task) = by_id.get(id) else {
        return set;
    };
    if !visiting.insert(id) {
        return set;
    }
    for dep in &task.dependencies {
        if by_id.contains_key(dep.as_str()) {
            set.insert(dep.as_str());
            set.extend(prerequisites(dep, by_id, memo, visiting));
        }
    }
    visiting.remove(id);
    memo.insert(id, set.clone());
    set
}

/// Group tasks that can run side by side, ordered by level.
pub fn parallel_groups(tasks: &[Task]) -> Vec<ParallelGroup> {
    let levels = compute_levels(tasks);
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();

    let mut groups: BTreeMap<(usize, Vec<TaskId>), Vec<TaskId>> = BTreeMap::new();
    for task in tasks {
        let level = levels.get(&task.id).copied().unwrap_or(0);
        let prereqs: Vec<TaskId> = prerequisites(&task.id, &by_id, &mut memo, &mut visiting)
            .into_iter()
            .map(str::to_string)
            .collect();
        groups.entry((level, prereqs)).or_default().push(task.id.clone());
    }
    groups
        .into_iter()
        .map(|((level, prerequisites), mut tasks)| {
            tasks.sort();
            ParallelGroup {
                level,
                prerequisites,
                tasks,
            }
        })
        .collect()
}

/// Keeps idle workers busy with READY tasks, lowest level first.
pub struct ParallelOptimizer {
    coordinator: Arc<Coordinator>,
    rebalance_interval: Duration,
}

impl ParallelOptimizer {
    pub fn new(coordinator: Arc<Coordinator>, rebalance_interval: Duration) -> Self {
        Self {
            coordinator,
            rebalance_interval,
        }
    }

    pub fn from_config(coordinator: Arc<Coordinator>, config: &ConductorConfig) -> Self {
        Self::new(coordinator, config.optimizer.rebalance_interval())
    }

    /// Running workers with nothing ASSIGNED or IN_PROGRESS.
    pub fn idle_agents(&self) -> Vec<String> {
        self.coordinator
            .agents()
            .into_iter()
            .filter(|a| {
                matches!(a.kind, AgentKind::Worker { .. })
                    && matches!(a.state, AgentState::Started | AgentState::Running)
                    && a.workload == 0
            })
            .map(|a| a.id)
            .collect()
    }

    /// Offer READY tasks, level by level, to `idle` in order.
    ///
    /// Tasks that conflict with in-flight work are skipped for this round.
    pub async fn assign_idle_agents(&self, idle: &[String]) -> Vec<(TaskId, String)> {
        let mut assigned = Vec::new();
        if idle.is_empty() {
            return assigned;
        }
        let tasks = self.coordinator.tasks();
        let levels = compute_levels(&tasks);
        let mut ready: Vec<(usize, TaskId)> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| (levels.get(&t.id).copied().unwrap_or(0), t.id.clone()))
            .collect();
        ready.sort();

        let mut agents = idle.iter();
        let mut agent = agents.next();
        for (level, task_id) in ready {
            let Some(agent_id) = agent else {
                break;
            };
            match self.coordinator.assign_task(&task_id, agent_id).await {
                Ok(()) => {
                    debug!(task_id = %task_id, agent_id = %agent_id, level, "Optimizer assigned task");
                    assigned.push((task_id, agent_id.clone()));
                    agent = agents.next();
                }
                Err(ConductorError::Conflict(reason)) => {
                    debug!(task_id = %task_id, %reason, "Skipping conflicting task this round");
                }
                Err(e) => {
                    debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Assignment skipped");
                }
            }
        }
        assigned
    }

    /// One rebalancing round over the currently idle agents.
    pub async fn rebalance(&self) -> Vec<(TaskId, String)> {
        let idle = self.idle_agents();
        let assigned = self.assign_idle_agents(&idle).await;
        if !assigned.is_empty() {
            info!(idle = idle.len(), assigned = assigned.len(), "Rebalanced idle agents");
        }
        assigned
    }

    pub fn metrics(&self) -> ParallelMetrics {
        let tasks = self.coordinator.tasks();
        let levels = compute_levels(&tasks);
        let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
        for level in levels.values() {
            *sizes.entry(*level).or_default() += 1;
        }
        let theoretical_max = sizes.values().copied().max().unwrap_or(0);
        let current_parallel = tasks.iter().filter(|t| t.status.is_active()).count();
        let efficiency = if theoretical_max == 0 {
            0.0
        } else {
            current_parallel as f64 / theoretical_max as f64
        };
        ParallelMetrics {
            current_parallel,
            theoretical_max,
            efficiency,
            levels: sizes.len(),
        }
    }

    /// Rebalance on every tick until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = interval(self.rebalance_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.rebalance_interval.as_millis() as u64, "Optimizer started");
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.rebalance().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Optimizer stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::conflicts::ConflictPrevention;

    fn diamond() -> Vec<Task> {
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_dependencies(["a"]),
            Task::new("c", "C").with_dependencies(["a"]),
            Task::new("d", "D").with_dependencies(["b", "c"]),
            Task::new("e", "E"),
        ]
    }

    #[test]
    fn test_levels_diamond() {
        let levels = compute_levels(&diamond());
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 1);
        assert_eq!(levels["c"], 1);
        assert_eq!(levels["d"], 2);
        assert_eq!(levels["e"], 0);
    }

    #[test]
    fn test_levels_ignore_missing_and_cycles() {
        let tasks = vec![
            Task::new("a", "A").with_dependencies(["ghost"]),
            Task::new("x", "X").with_dependencies(["y"]),
            Task::new("y", "Y").with_dependencies(["x"]),
        ];
        let levels = compute_levels(&tasks);
        assert_eq!(levels["a"], 0);
        assert_eq!(levels.len(), 3);
        assert!(levels["x"] <= 1 && levels["y"] <= 1);
    }

    #[test]
    fn test_groups_split_by_prerequisites() {
        let mut tasks = diamond();
        tasks.push(Task::new("f", "F").with_dependencies(["e"]));
        let groups = parallel_groups(&tasks);

        let level0: Vec<_> = groups.iter().filter(|g| g.level == 0).collect();
        assert_eq!(level0.len(), 1);
        assert_eq!(level0[0].tasks, vec!["a", "e"]);

        let level1: Vec<_> = groups.iter().filter(|g| g.level == 1).collect();
        assert_eq!(level1.len(), 2);
        let bc = level1.iter().find(|g| g.prerequisites == vec!["a"]).unwrap();
        assert_eq!(bc.tasks, vec!["b", "c"]);
        let d = groups.iter().find(|g| g.level == 2).unwrap();
        assert_eq!(d.prerequisites, vec!["a", "b", "c"]);
    }

    async fn optimizer(tasks: Vec<Task>, agents: &[&str]) -> ParallelOptimizer {
        let conflicts = Arc::new(ConflictPrevention::new(
            "/tmp/conductor-optimizer-test",
            chrono::Duration::minutes(30),
            true,
        ));
        let c = Arc::new(Coordinator::new("demo", "/tmp/conductor-optimizer-test", conflicts, 2));
        for agent in agents {
            c.register_agent(agent, AgentKind::worker("general"));
            c.set_agent_state(agent, AgentState::Running).unwrap();
        }
        c.add_tasks(tasks).await.unwrap();
        ParallelOptimizer::new(c, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_assigns_ready_tasks_to_idle_agents() {
        let opt = optimizer(diamond(), &["w-1", "w-2", "w-3"]).await;
        assert_eq!(opt.idle_agents().len(), 3);
        let assigned = opt.rebalance().await;
        assert_eq!(
            assigned,
            vec![("a".to_string(), "w-1".to_string()), ("e".to_string(), "w-2".to_string())]
        );
        assert_eq!(opt.idle_agents(), vec!["w-3".to_string()]);

        let m = opt.metrics();
        assert_eq!(m.current_parallel, 2);
        assert_eq!(m.theoretical_max, 2);
        assert!((m.efficiency - 1.0).abs() < f64::EPSILON);
        assert_eq!(m.levels, 3);
    }

    #[tokio::test]
    async fn test_conflicting_task_is_skipped() {
        let tasks = vec![
            Task::new("a", "A").with_artifacts(["x.txt"]),
            Task::new("b", "B").with_artifacts(["x.txt"]),
            Task::new("c", "C").with_artifacts(["z.txt"]),
        ];
        let opt = optimizer(tasks, &["w-1", "w-2"]).await;
        let assigned = opt.rebalance().await;
        assert_eq!(
            assigned,
            vec![("a".to_string(), "w-1".to_string()), ("c".to_string(), "w-2".to_string())]
        );
        assert_eq!(opt.coordinator.task("b").unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_paused_agents_are_not_idle() {
        let opt = optimizer(diamond(), &["w-1", "w-2"]).await;
        opt.coordinator.set_agent_state("w-2", AgentState::Paused).unwrap();
        assert_eq!(opt.idle_agents(), vec!["w-1".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let opt = Arc::new(optimizer(diamond(), &["w-1"]).await);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&opt).run(rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opt.coordinator.task("a").unwrap().status, TaskStatus::Assigned);
    }
}
