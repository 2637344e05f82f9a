use crate::coordinator::Coordinator;
use crate::executor::{ExecutionContext, ExecutionOutcome, WorkExecutor};
use crate::types::{AgentKind, AgentMessage, AgentState, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use conductor_core::{ConductorConfig, ConductorError, ConductorResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The common lifecycle every participant implements.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> AgentKind;
    async fn start(&self) -> ConductorResult<()>;
    /// Observed within one poll tick. In-flight work stays assigned.
    async fn stop(&self) -> ConductorResult<()>;
    async fn pause(&self) -> ConductorResult<()>;
    async fn resume(&self) -> ConductorResult<()>;
    fn is_running(&self) -> bool;
}

/// Signal sent to an agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentControl {
    Run,
    Pause,
    Stop,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Control channel and task handle behind an [`Agent`] implementation.
pub(crate) struct AgentRuntime {
    control: watch::Sender<AgentControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub(crate) fn new() -> Self {
        let (control, _) = watch::channel(AgentControl::Stop);
        Self {
            control,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn signal(&self, control: AgentControl) {
        self.control.send_replace(control);
    }

    /// Spawn the loop built by `make` unless one is already running.
    pub(crate) fn launch<F, Fut>(&self, make: F) -> ConductorResult<()>
    where
        F: FnOnce(watch::Receiver<AgentControl>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ConductorError::Orchestrator("agent is already running".into()));
        }
        self.control.send_replace(AgentControl::Run);
        *handle = Some(tokio::spawn(make(self.control.subscribe())));
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        self.control.send_replace(AgentControl::Stop);
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Agent loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

/// Wait until the control value is no longer `Pause`. Returns false on stop.
pub(crate) async fn wait_while_paused(rx: &mut watch::Receiver<AgentControl>) -> bool {
    loop {
        match *rx.borrow_and_update() {
            AgentControl::Run => return true,
            AgentControl::Stop => return false,
            AgentControl::Pause => {}
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Timing knobs for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Keep-alive checkpoint cadence while an executor runs.
    pub checkpoint_interval: Duration,
    pub task_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            poll_interval: config.agents.poll_interval(),
            heartbeat_interval: config.agents.heartbeat_interval(),
            checkpoint_interval: Duration::from_secs((config.supervisor.stale_task_secs / 3).max(1)),
            task_timeout: config.agents.task_timeout(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(60),
            task_timeout: Duration::from_secs(1800),
        }
    }
}

struct WorkerInner {
    id: String,
    specialization: String,
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn WorkExecutor>,
    settings: WorkerSettings,
    /// Attempt numbers of tasks this worker may resume after a stop.
    attempts: Mutex<HashMap<TaskId, u32>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

/// A worker that claims tasks from the coordinator and runs them through a
/// [`WorkExecutor`].
pub struct WorkerAgent {
    inner: Arc<WorkerInner>,
    runtime: AgentRuntime,
}

enum Attempt {
    Finished(ConductorResult<ExecutionOutcome>),
    TimedOut,
    Stopped,
}

impl WorkerAgent {
    pub fn new(
        id: impl Into<String>,
        specialization: impl Into<String>,
        coordinator: Arc<Coordinator>,
        executor: Arc<dyn WorkExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: id.into(),
                specialization: specialization.into(),
                coordinator,
                executor,
                settings,
                attempts: Mutex::new(HashMap::new()),
                last_heartbeat: Mutex::new(None),
            }),
            runtime: AgentRuntime::new(),
        }
    }
}

impl WorkerInner {
    fn kind(&self) -> AgentKind {
        AgentKind::worker(self.specialization.clone())
    }

    /// Heartbeat at most once per configured interval unless `force`.
    fn heartbeat(&self, task_id: Option<&str>, state: AgentState, force: bool) {
        {
            let mut last = self.last_heartbeat.lock();
            if !force
                && last.is_some_and(|t| t.elapsed() < self.settings.heartbeat_interval)
            {
                return;
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self.coordinator.record_heartbeat(&self.id, task_id, Some(state)) {
            warn!(agent_id = %self.id, error = %e, "Heartbeat rejected");
        }
    }

    /// Resume own work first, otherwise claim the first READY task that
    /// does not conflict.
    async fn next_task(&self) -> Option<Task> {
        if let Some(task) = self.coordinator.get_agent_tasks(&self.id).into_iter().next() {
            return Some(task);
        }
        for candidate in self.coordinator.get_ready_tasks() {
            match self.coordinator.assign_task(&candidate.id, &self.id).await {
                Ok(()) => return self.coordinator.task(&candidate.id),
                Err(ConductorError::Conflict(reason)) => {
                    debug!(agent_id = %self.id, task_id = %candidate.id, %reason, "Skipping conflicting task");
                }
                Err(ConductorError::InvalidTransition(_)) => {}
                Err(e) => {
                    warn!(agent_id = %self.id, task_id = %candidate.id, error = %e, "Assignment failed");
                }
            }
        }
        None
    }

    async fn send(&self, message: AgentMessage) {
        let task_id = message.task_id.clone();
        if let Err(e) = self.coordinator.process_message(message).await {
            warn!(agent_id = %self.id, %task_id, error = %e, "Message rejected");
        }
    }

    /// Run one attempt. Returns false when the loop must stop.
    async fn work_on(&self, task: Task, rx: &mut watch::Receiver<AgentControl>) -> bool {
        if let Err(e) = self.coordinator.start_task(&task.id, &self.id).await {
            warn!(agent_id = %self.id, task_id = %task.id, error = %e, "Cannot start task");
            return true;
        }
        self.heartbeat(Some(&task.id), AgentState::Running, true);

        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(task.id.clone()).or_insert(task.retry_count());
            *n += 1;
            *n
        };
        self.send(AgentMessage::checkpoint(
            &self.id,
            &task.id,
            task.progress,
            format!("attempt {attempt} started"),
            "run executor",
        ))
        .await;

        let workspace = self.coordinator.workspace().to_path_buf();
        let scratch_dir = match self.coordinator.conflicts().workspaces().prepare(&self.id).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "No isolated workspace, using shared one");
                workspace.clone()
            }
        };
        let ctx = ExecutionContext {
            agent_id: self.id.clone(),
            workspace,
            scratch_dir,
            attempt,
        };

        info!(agent_id = %self.id, task_id = %task.id, attempt, "Executing task");
        let started = Instant::now();
        let result = self.execute(&task, &ctx, rx).await;
        if !matches!(result, Attempt::Stopped) {
            // Any other outcome hands the task back to the coordinator.
            self.attempts.lock().remove(&task.id);
        }

        match result {
            Attempt::Stopped => {
                info!(agent_id = %self.id, task_id = %task.id, "Stopped mid-task, work stays assigned");
                return false;
            }
            Attempt::Finished(Ok(outcome)) if outcome.success => {
                debug!(agent_id = %self.id, task_id = %task.id, elapsed_ms = started.elapsed().as_millis() as u64, "Executor succeeded");
                let mut message = AgentMessage::completion(&self.id, &task.id, outcome.artifacts);
                if let Some(summary) = outcome.message {
                    message = message.with_message(summary);
                }
                self.send(message).await;
            }
            Attempt::Finished(Ok(outcome)) => {
                let reason = outcome
                    .message
                    .unwrap_or_else(|| "execution failed: executor reported failure".into());
                self.report_blocked(&task, reason).await;
            }
            Attempt::Finished(Err(e)) => {
                self.coordinator.monitor().record_error(&self.id);
                self.report_blocked(&task, format!("execution failed: {e}")).await;
            }
            Attempt::TimedOut => {
                let secs = self.settings.task_timeout.as_secs();
                self.report_blocked(&task, format!("execution timed out after {secs}s"))
                    .await;
            }
        }
        self.heartbeat(None, AgentState::Running, true);
        true
    }

    async fn report_blocked(&self, task: &Task, reason: String) {
        warn!(agent_id = %self.id, task_id = %task.id, %reason, "Attempt failed");
        self.send(AgentMessage::status_update(
            &self.id,
            &task.id,
            TaskStatus::Blocked,
            None,
            Some(reason),
        ))
        .await;
    }

    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        rx: &mut watch::Receiver<AgentControl>,
    ) -> Attempt {
        let exec = self.executor.execute(task, ctx);
        tokio::pin!(exec);
        let deadline = sleep(self.settings.task_timeout);
        tokio::pin!(deadline);
        let mut ticks = interval(self.settings.heartbeat_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_checkpoint = Instant::now();

        loop {
            tokio::select! {
                result = &mut exec => return Attempt::Finished(result),
                _ = &mut deadline => return Attempt::TimedOut,
                _ = ticks.tick() => {
                    self.heartbeat(Some(&task.id), AgentState::Running, false);
                    if last_checkpoint.elapsed() >= self.settings.checkpoint_interval {
                        last_checkpoint = Instant::now();
                        let progress = self
                            .coordinator
                            .task(&task.id)
                            .map_or(task.progress, |t| t.progress);
                        self.send(AgentMessage::checkpoint(
                            &self.id,
                            &task.id,
                            progress,
                            "executor still running",
                            "wait for executor",
                        ))
                        .await;
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() == AgentControl::Stop {
                        return Attempt::Stopped;
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut rx: watch::Receiver<AgentControl>) {
        self.coordinator.register_agent(&self.id, self.kind());
        self.heartbeat(None, AgentState::Started, true);
        info!(agent_id = %self.id, specialization = %self.specialization, "Worker started");

        loop {
            let control = *rx.borrow_and_update();
            match control {
                AgentControl::Stop => break,
                AgentControl::Pause => {
                    self.heartbeat(None, AgentState::Paused, true);
                    if !wait_while_paused(&mut rx).await {
                        break;
                    }
                    continue;
                }
                AgentControl::Run => {}
            }

            self.heartbeat(None, AgentState::Running, false);
            match self.next_task().await {
                Some(task) => {
                    if !self.work_on(task, &mut rx).await {
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        _ = sleep(self.settings.poll_interval) => {}
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Err(e) = self.coordinator.set_agent_state(&self.id, AgentState::Stopped) {
            warn!(agent_id = %self.id, error = %e, "Could not record stop");
        }
        info!(agent_id = %self.id, "Worker stopped");
    }
}

#[async_trait]
impl Agent for WorkerAgent {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn kind(&self) -> AgentKind {
        self.inner.kind()
    }

    async fn start(&self) -> ConductorResult<()> {
        let inner = Arc::clone(&self.inner);
        self.runtime.launch(move |rx| inner.run(rx))
    }

    async fn stop(&self) -> ConductorResult<()> {
        self.runtime.shutdown().await;
        Ok(())
    }

    async fn pause(&self) -> ConductorResult<()> {
        self.runtime.signal(AgentControl::Pause);
        Ok(())
    }

    async fn resume(&self) -> ConductorResult<()> {
        self.runtime.signal(AgentControl::Run);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.runtime.is_running()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::conflicts::ConflictPrevention;
    use crate::types::BlockerType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl WorkExecutor for ScriptedExecutor {
        async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> ConductorResult<ExecutionOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ConductorError::Executor("exit status 1".into()));
            }
            Ok(ExecutionOutcome::succeeded(task.artifacts.clone()))
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl WorkExecutor for HangingExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> ConductorResult<ExecutionOutcome> {
            sleep(Duration::from_secs(3600)).await;
            Ok(ExecutionOutcome::default())
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(20),
            checkpoint_interval: Duration::from_millis(50),
            task_timeout: Duration::from_secs(30),
        }
    }

    fn coordinator(dir: &std::path::Path) -> Arc<Coordinator> {
        let conflicts = Arc::new(ConflictPrevention::new(dir, chrono::Duration::minutes(30), true));
        Arc::new(Coordinator::new("test", dir, conflicts, 2))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_worker_completes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        coord
            .add_tasks(vec![
                Task::new("a", "A").with_artifacts(["a.txt"]),
                Task::new("b", "B").with_dependencies(["a"]),
            ])
            .await
            .unwrap();
        let executor = Arc::new(ScriptedExecutor { calls: AtomicUsize::new(0), fail_first: 0 });
        let worker = WorkerAgent::new("w-1", "general", coord.clone(), executor, settings());
        worker.start().await.unwrap();
        assert!(worker.start().await.is_err());

        wait_for(|| coord.is_done()).await;
        worker.stop().await.unwrap();
        assert!(!worker.is_running());
        assert_eq!(coord.agent("w-1").unwrap().state, AgentState::Stopped);
        assert_eq!(coord.monitor().get("w-1").unwrap().metrics.tasks_completed, 2);
        assert!(dir.path().join(".conductor/agents/w-1").is_dir());
    }

    #[tokio::test]
    async fn test_executor_error_blocks_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        coord.add_task(Task::new("a", "A")).await.unwrap();
        let executor = Arc::new(ScriptedExecutor { calls: AtomicUsize::new(0), fail_first: 1 });
        let worker = WorkerAgent::new("w-1", "general", coord.clone(), executor, settings());
        worker.start().await.unwrap();

        wait_for(|| coord.task("a").unwrap().status == TaskStatus::Blocked).await;
        let a = coord.task("a").unwrap();
        assert!(a.blocker_message.as_deref().unwrap().starts_with("execution failed"));
        assert_eq!(a.retry_count(), 1);
        assert_ne!(a.blocker_type, Some(BlockerType::Dependency));
        assert!(worker.inner.attempts.lock().is_empty());

        // A task without dependencies waits for a requeue.
        coord.resolve_all().await;
        assert_eq!(coord.task("a").unwrap().status, TaskStatus::Blocked);
        coord.requeue_task("a", "retry").await.unwrap();
        wait_for(|| coord.task("a").unwrap().is_completed()).await;
        worker.stop().await.unwrap();
        assert!(worker.inner.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_leaves_task_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        coord.add_task(Task::new("a", "A")).await.unwrap();
        let worker = WorkerAgent::new("w-1", "general", coord.clone(), Arc::new(HangingExecutor), settings());
        worker.start().await.unwrap();

        wait_for(|| coord.task("a").unwrap().status == TaskStatus::InProgress).await;
        let begun = Instant::now();
        worker.stop().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1));
        let a = coord.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::InProgress);
        assert_eq!(a.assigned_agent.as_deref(), Some("w-1"));
        assert_eq!(worker.inner.attempts.lock().get("a"), Some(&1));
    }

    #[tokio::test]
    async fn test_timeout_reports_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        coord.add_task(Task::new("a", "A")).await.unwrap();
        let mut s = settings();
        s.task_timeout = Duration::from_millis(100);
        let worker = WorkerAgent::new("w-1", "general", coord.clone(), Arc::new(HangingExecutor), s);
        worker.start().await.unwrap();

        wait_for(|| coord.task("a").unwrap().status == TaskStatus::Blocked).await;
        worker.stop().await.unwrap();
        let a = coord.task("a").unwrap();
        assert!(a.blocker_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let executor = Arc::new(ScriptedExecutor { calls: AtomicUsize::new(0), fail_first: 0 });
        let worker = WorkerAgent::new("w-1", "general", coord.clone(), executor, settings());
        worker.start().await.unwrap();
        wait_for(|| coord.agent("w-1").is_some_and(|a| a.state == AgentState::Running)).await;

        worker.pause().await.unwrap();
        wait_for(|| coord.agent("w-1").is_some_and(|a| a.state == AgentState::Paused)).await;
        coord.add_task(Task::new("a", "A")).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(coord.task("a").unwrap().status, TaskStatus::Ready);

        worker.resume().await.unwrap();
        wait_for(|| coord.task("a").unwrap().is_completed()).await;
        worker.stop().await.unwrap();
    }
}
