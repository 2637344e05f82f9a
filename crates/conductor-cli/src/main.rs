//! `conductor`: run a task file through the orchestration engine.

mod command_executor;

use clap::{Parser, Subcommand};
use command_executor::CommandExecutor;
use conductor_core::{AgentPoolConfig, ConductorConfig};
use conductor_orchestrator::{
    compute_levels, parallel_groups, Agent, AgentSpawner, Coordinator, JsonFileTaskStore,
    ParallelOptimizer, SpawnFactory, SpawnRequest, Supervisor, SupervisorSettings, TaskStatus,
    TaskStore, WorkExecutor, WorkerAgent, WorkerSettings,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every task with a pool of worker agents
    Run {
        /// JSON task file
        #[arg(short, long)]
        tasks: PathBuf,
        /// Replace the configured pools with N general workers
        #[arg(long)]
        agents: Option<usize>,
    },
    /// Print the resolved status snapshot of a task file
    Status {
        #[arg(short, long)]
        tasks: PathBuf,
    },
    /// Print dependency levels and parallel groups
    Levels {
        #[arg(short, long)]
        tasks: PathBuf,
    },
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Coordinator over the task file; `persist` wires the file in as the store.
async fn load_coordinator(
    config: &mut ConductorConfig,
    tasks_path: &Path,
    persist: bool,
) -> anyhow::Result<(Arc<Coordinator>, usize)> {
    let store = Arc::new(JsonFileTaskStore::new(tasks_path));
    if let Some(project) = store.project().await? {
        config.project = project;
    }
    let tasks = store.load_tasks().await?;
    let mut coordinator = Coordinator::from_config(config);
    if persist {
        coordinator = coordinator.with_store(store);
    }
    let count = coordinator.add_tasks(tasks).await?;
    Ok((Arc::new(coordinator), count))
}

async fn run(mut config: ConductorConfig, tasks_path: &Path, agents: Option<usize>) -> anyhow::Result<()> {
    if let Some(n) = agents {
        anyhow::ensure!(n > 0, "--agents must be at least 1");
        config.agents.pools = vec![AgentPoolConfig {
            specialization: "general".to_string(),
            count: n,
        }];
    }
    let executor: Arc<dyn WorkExecutor> = Arc::new(
        CommandExecutor::from_config(&config.executor)
            .ok_or_else(|| anyhow::anyhow!("No [executor] program configured"))?,
    );

    let (coordinator, count) = load_coordinator(&mut config, tasks_path, true).await?;
    info!(project = %config.project, tasks = count, agents = config.total_agents(), "Starting run");

    let spawner = Arc::new(AgentSpawner::new());
    let worker_settings = WorkerSettings::from_config(&config);
    for pool in &config.agents.pools {
        let coordinator = coordinator.clone();
        let executor = executor.clone();
        let settings = worker_settings.clone();
        let factory: SpawnFactory = Arc::new(move |req: &SpawnRequest| {
            Ok(Arc::new(WorkerAgent::new(
                req.agent_id.clone(),
                req.specialization.clone(),
                coordinator.clone(),
                executor.clone(),
                settings.clone(),
            )) as Arc<dyn Agent>)
        });
        spawner.register(pool.specialization.clone(), factory);
    }
    for pool in &config.agents.pools {
        for _ in 0..pool.count {
            spawner.spawn(&pool.specialization, None).await?;
        }
    }

    let supervisor = Supervisor::new(
        "supervisor",
        coordinator.clone(),
        SupervisorSettings::from_config(&config),
    )
    .with_spawner(spawner.clone());
    supervisor.start().await?;

    let optimizer = Arc::new(ParallelOptimizer::from_config(coordinator.clone(), &config));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let optimizer_handle = tokio::spawn(Arc::clone(&optimizer).run(shutdown_rx));

    let stall_limit = config.supervisor.audit_interval() * 2;
    let mut stalled_since: Option<Instant> = None;
    let mut ticks = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
            _ = ticks.tick() => {
                if coordinator.is_done() {
                    info!("All tasks are terminal");
                    break;
                }
                let counts = coordinator.counts_by_status();
                let runnable = [TaskStatus::Ready, TaskStatus::Assigned, TaskStatus::InProgress]
                    .iter()
                    .map(|s| counts.get(s).copied().unwrap_or(0))
                    .sum::<usize>();
                if runnable > 0 {
                    stalled_since = None;
                    continue;
                }
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= stall_limit {
                    warn!(stalled_secs = since.elapsed().as_secs(), "No runnable work left, giving up");
                    break;
                }
            }
        }
    }

    shutdown_tx.send_replace(true);
    if let Err(e) = optimizer_handle.await {
        warn!(error = %e, "Optimizer task ended abnormally");
    }
    supervisor.stop().await?;
    spawner.stop_all().await?;

    let status = coordinator.status();
    print_json(&status)?;
    let unfinished: usize = status
        .counts
        .iter()
        .filter(|(s, _)| !s.is_terminal())
        .map(|(_, n)| n)
        .sum();
    anyhow::ensure!(unfinished == 0, "{unfinished} task(s) did not finish");
    Ok(())
}

async fn status(mut config: ConductorConfig, tasks_path: &Path) -> anyhow::Result<()> {
    let (coordinator, _) = load_coordinator(&mut config, tasks_path, false).await?;
    print_json(&coordinator.status())
}

async fn levels(tasks_path: &Path) -> anyhow::Result<()> {
    let tasks = JsonFileTaskStore::new(tasks_path).load_tasks().await?;
    let levels = compute_levels(&tasks);
    let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
    for level in levels.values() {
        *sizes.entry(*level).or_default() += 1;
    }
    print_json(&serde_json::json!({
        "levels": levels,
        "groups": parallel_groups(&tasks),
        "theoretical_max": sizes.values().copied().max().unwrap_or(0),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = ConductorConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;

    match cli.command {
        Commands::Run { tasks, agents } => run(config, &tasks, agents).await,
        Commands::Status { tasks } => status(config, &tasks).await,
        Commands::Levels { tasks } => levels(&tasks).await,
    }
}
