use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use orca::core::artifact::ArtifactSet;
use orca::core::task::Task;
use orca::instance::{Event, InstanceId, Services, Supervisor};
use orca::orchestration::{builtin_registry, Planner};
use orca::state::{FileSnapshotStore, SnapshotStore};
use orca::{AgentConfig, Error, Result};

/// Orca - durable event-driven agent orchestrator
#[derive(Parser, Debug)]
#[command(name = "orca")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    ORCA_DEBUG=1    Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.orca/orca.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a supervised instance over the given tasks and print its summary
    Run {
        /// Agent configuration (TOML, default: ~/.orca/config.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Task as JSON, e.g. '{"id":"t1","kind":"research","payload":{"topic":"X"}}'
        #[arg(long = "task", short = 't')]
        tasks: Vec<String>,

        /// Snapshot directory (default: ~/.orca/snapshots)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Instance id; a stored run with this id is resumed
        #[arg(long)]
        instance: Option<String>,
    },

    /// Print the plan the configured planner builds for a task
    Plan {
        /// Agent configuration (TOML, default: ~/.orca/config.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Task as JSON
        #[arg(long, short = 't')]
        task: String,
    },

    /// List the built-in tools with their descriptions
    Tools,

    /// Print the summary of a stored snapshot
    Inspect {
        /// Instance id to inspect
        instance: String,

        /// Snapshot directory (default: ~/.orca/snapshots)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            tasks,
            snapshot_dir,
            instance,
        } => {
            let config = load_config(config)?;
            orca::log::init_with_debug(cli.debug, &config.log_level);
            run_agent(config, tasks, snapshot_dir, instance)
        }
        Command::Plan { config, task } => {
            let config = load_config(config)?;
            orca::log::init_with_debug(cli.debug, &config.log_level);
            show_plan(config, &task)
        }
        Command::Tools => {
            list_tools();
            Ok(())
        }
        Command::Inspect {
            instance,
            snapshot_dir,
        } => {
            orca::log::init_with_debug(cli.debug, "info");
            inspect(&instance, snapshot_dir)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AgentConfig> {
    let path = match path {
        Some(path) => path,
        None => AgentConfig::config_path()?,
    };
    AgentConfig::load(&path)
}

fn parse_task(text: &str) -> Result<Task> {
    serde_json::from_str(text).map_err(|e| Error::Validation(format!("invalid task JSON: {}", e)))
}

fn snapshot_dir_or_default(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => AgentConfig::default_snapshot_dir(),
    }
}

fn run_agent(
    config: AgentConfig,
    tasks: Vec<String>,
    snapshot_dir: Option<PathBuf>,
    instance: Option<String>,
) -> Result<()> {
    let tasks = tasks
        .iter()
        .map(|text| parse_task(text))
        .collect::<Result<Vec<_>>>()?;
    let store = FileSnapshotStore::new(snapshot_dir_or_default(snapshot_dir)?);
    let instance_id = instance.map(InstanceId::new).unwrap_or_else(InstanceId::generate);
    tracing::info!(
        instance = %instance_id,
        tasks = tasks.len(),
        snapshots = %store.dir().display(),
        "Starting run"
    );
    let services = Services::new(builtin_registry()).with_store(Arc::new(store));

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async move {
        let (handle, run) = Supervisor::new(instance_id, services).launch();

        // Ctrl-C stops after in-flight steps; the final snapshot resumes the run.
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::warn!("Interrupted, shutting down");
                        let _ = handle.post(Event::Shutdown { drain: false });
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        handle.configure(config).await?;
        for task in tasks {
            handle.enqueue_task(task).await?;
        }
        handle.shutdown_when_idle().await?;
        drop(handle);

        let result = run.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
        cancel.cancel();
        let _ = watcher.await;
        result
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn show_plan(config: AgentConfig, task: &str) -> Result<()> {
    let task = parse_task(task)?;
    let rt = tokio::runtime::Runtime::new()?;
    let plan = rt.block_on(Planner::new().build_plan(
        &task,
        config.planner_mode,
        &config,
        &ArtifactSet::new(),
    ))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn list_tools() {
    let tools = builtin_registry().tool_descriptions();
    let width = tools.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, description) in tools {
        println!("{:width$}  {}", name, description, width = width);
    }
}

fn inspect(instance: &str, snapshot_dir: Option<PathBuf>) -> Result<()> {
    let store = FileSnapshotStore::new(snapshot_dir_or_default(snapshot_dir)?);
    let rt = tokio::runtime::Runtime::new()?;
    let id = InstanceId::new(instance);

    match rt.block_on(store.load(&id))? {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot.summary())?);
            Ok(())
        }
        None => {
            let known = rt.block_on(store.instances())?;
            let known: Vec<&str> = known.iter().map(InstanceId::as_str).collect();
            Err(Error::Persistence(format!(
                "no snapshot for instance {} in {} (known: {})",
                instance,
                store.dir().display(),
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            )))
        }
    }
}
