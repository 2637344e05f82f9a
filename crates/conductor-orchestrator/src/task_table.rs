use crate::blocker::{is_dependency_attributable, is_transient_failure};
use crate::types::{BlockerType, Task, TaskId, TaskStatus};
use conductor_core::{ConductorError, ConductorResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// The shared task table with dependency-driven status resolution.
///
/// Insertion order is kept so listings and assignment offers are stable.
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    retry_budget: u32,
}

impl TaskTable {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            retry_budget,
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Insert a batch of tasks.
    ///
    /// Rejects the whole batch on a duplicate ID or if it would introduce a
    /// dependency cycle. Statuses are not resolved here.
    pub fn insert_all(&mut self, batch: Vec<Task>) -> ConductorResult<Vec<TaskId>> {
        let mut seen = HashSet::new();
        for task in &batch {
            if self.tasks.contains_key(&task.id) || !seen.insert(task.id.clone()) {
                return Err(ConductorError::Orchestrator(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        let ids: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();
        for task in batch {
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }

        if let Some(id) = self.find_cycle() {
            for id in &ids {
                self.tasks.remove(id);
            }
            self.order.retain(|id| !ids.contains(id));
            return Err(ConductorError::Orchestrator(format!(
                "dependency cycle through task {id}"
            )));
        }
        Ok(ids)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// All tasks in insertion order.
    pub fn all(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.all().into_iter().filter(|t| t.status == status).collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Count per status; every status is present, zero included.
    pub fn counts_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// True when every task is COMPLETED or FAILED.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Tasks that list `id` as a direct dependency, in insertion order.
    pub fn dependents_of(&self, id: &str) -> Vec<TaskId> {
        self.all()
            .into_iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// An ASSIGNED/IN_PROGRESS task of another agent sharing an artifact with `task`.
    pub fn active_overlap(&self, task: &Task, agent: &str) -> Option<(TaskId, String)> {
        self.all().into_iter().find_map(|other| {
            let owner = other.assigned_agent.as_deref()?;
            (other.id != task.id
                && other.status.is_active()
                && owner != agent
                && other.shares_artifacts_with(task))
            .then(|| (other.id.clone(), owner.to_string()))
        })
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    fn find_cycle(&self) -> Option<TaskId> {
        let mut visited = HashMap::new();
        for id in &self.order {
            if self.dfs_cycle(id, &mut visited) {
                return Some(id.clone());
            }
        }
        None
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// True when `from` reaches `to` by following dependency edges.
    pub fn depends_transitively(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(id) {
                stack.extend(task.dependencies.iter().map(String::as_str));
            }
        }
        false
    }

    /// Recompute a task's status from its dependencies. Returns whether the
    /// status changed.
    pub fn resolve(&mut self, id: &str) -> bool {
        let Some(task) = self.tasks.get(id) else {
            return false;
        };
        let status = task.status;
        if matches!(
            status,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Assigned
                | TaskStatus::InProgress
                | TaskStatus::Review
        ) {
            return false;
        }

        let missing: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|d| !self.tasks.contains_key(d.as_str()))
            .map(String::as_str)
            .collect();
        let waiting: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|d| {
                self.tasks
                    .get(d.as_str())
                    .is_some_and(|dep| !dep.status.satisfies_dependents())
            })
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            let message = format!("missing dependencies: {}", missing.join(", "));
            return self.block_on_dependencies(id, message, true);
        }
        if !waiting.is_empty() {
            let message = format!("waiting on dependencies: {}", waiting.join(", "));
            return self.block_on_dependencies(id, message, false);
        }

        // Without dependencies there is nothing to wait for: a BLOCKED task
        // stays blocked until an agent, a requeue or a deadlock breaker moves it.
        let releasable = match status {
            TaskStatus::Pending => true,
            TaskStatus::Blocked if !task.dependencies.is_empty() => {
                let message = task.blocker_message.as_deref();
                is_dependency_attributable(message, task.blocker_type)
                    || (message.is_some_and(|m| is_transient_failure(m, task.blocker_type))
                        && task.retry_count() <= self.retry_budget)
            }
            _ => false,
        };
        if !releasable {
            return false;
        }
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        task.clear_blocker();
        task.assigned_agent = None;
        task.status = TaskStatus::Ready;
        true
    }

    fn block_on_dependencies(&mut self, id: &str, message: String, overwrite: bool) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        let keep_existing = !overwrite
            && task.status == TaskStatus::Blocked
            && task
                .blocker_type
                .is_some_and(|kind| kind != BlockerType::Dependency);
        if !keep_existing {
            task.set_blocker(message, BlockerType::Dependency);
        }
        let changed = task.status != TaskStatus::Blocked;
        task.status = TaskStatus::Blocked;
        changed
    }

    /// Resolve every task; returns the ones whose status changed.
    pub fn resolve_all(&mut self) -> Vec<TaskId> {
        // Resolution never produces a status that satisfies dependents, so a
        // single pass in any order is stable.
        let ids = self.order.clone();
        ids.into_iter().filter(|id| self.resolve(id)).collect()
    }

    /// Re-resolve everything downstream of `id`; returns the tasks whose
    /// status changed.
    pub fn cascade(&mut self, id: &str) -> Vec<TaskId> {
        let mut queue: VecDeque<TaskId> = self.dependents_of(id).into();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut changed = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if self.resolve(&next) {
                queue.extend(self.dependents_of(&next));
                changed.push(next);
            }
        }
        changed
    }
}
