mod agent;
mod alert;
mod checkpoint;
mod command;
mod config;
mod git_checkpoint;
mod orchestrator;
mod pipeline;
mod planner;
mod retry;
mod tracker;
mod verify;
mod workers;

use agent::CliAgent;
use alert::{AlertSink, LogAlerts, WebhookAlerts};
use anyhow::{Context, Result};
use checkpoint::CheckpointStore;
use clap::{Parser, Subcommand};
use config::OrchestratorConfig;
use git_checkpoint::GitCheckpointManager;
use orchestrator::Orchestrator;
use pipeline::{PipelineConfig, ValidationPipeline};
use planner::{build_plan, FeatureInput};
use retry::RetryController;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracker::TrackerClient;
use tracing_subscriber::EnvFilter;
use workers::WorkerPool;

#[derive(Parser)]
#[command(name = "orchestrate")]
#[command(about = "Execution orchestrator for epics, features and tasks")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "orchestrate.yaml")]
    config: PathBuf,

    /// Working directory (defaults to current directory)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an epic from scratch
    Run {
        epic_id: String,
        /// Plan input as a JSON file of features; fetched from the tracker
        /// when omitted
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Human-readable epic identifier used in branch names
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Resume an epic from its checkpoint
    Resume {
        epic_id: String,
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Show the current checkpoint, if any
    Status,
    /// Delete the current checkpoint
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let config = OrchestratorConfig::load_or_default(&working_dir.join(&cli.config))?;

    match cli.command {
        Commands::Run {
            epic_id,
            plan,
            identifier,
        } => {
            let identifier = identifier.unwrap_or_else(|| epic_id.clone());
            execute(&config, &working_dir, &epic_id, &identifier, plan.as_deref(), false).await
        }
        Commands::Resume {
            epic_id,
            plan,
            identifier,
        } => {
            let identifier = identifier.unwrap_or_else(|| epic_id.clone());
            execute(&config, &working_dir, &epic_id, &identifier, plan.as_deref(), true).await
        }
        Commands::Status => status(&config, &working_dir),
        Commands::Clear => {
            checkpoint_store(&config, &working_dir).clear()?;
            println!("Checkpoint cleared.");
            Ok(())
        }
    }
}

async fn execute(
    config: &OrchestratorConfig,
    working_dir: &Path,
    epic_id: &str,
    identifier: &str,
    plan_file: Option<&Path>,
    resume: bool,
) -> Result<()> {
    let tracker = config
        .tracker_url
        .as_ref()
        .map(|url| Arc::new(TrackerClient::new(url.clone())));

    let features = load_features(epic_id, plan_file, tracker.as_deref())?;
    let plan = build_plan(epic_id, &features);
    if plan.total_items == 0 {
        anyhow::bail!("Epic {} has no items to execute", epic_id);
    }

    let orchestrator = wire_orchestrator(config, working_dir, tracker);
    let outcome = orchestrator.run(&plan, identifier, resume).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn load_features(
    epic_id: &str,
    plan_file: Option<&Path>,
    tracker: Option<&TrackerClient>,
) -> Result<Vec<FeatureInput>> {
    if let Some(path) = plan_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        return serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()));
    }
    let tracker = tracker
        .context("No plan file given and no tracker_url configured; cannot build a plan")?;
    tracker.fetch_features(epic_id)
}

fn wire_orchestrator(
    config: &OrchestratorConfig,
    working_dir: &Path,
    tracker: Option<Arc<TrackerClient>>,
) -> Arc<Orchestrator> {
    let git = Arc::new(
        GitCheckpointManager::new(working_dir).with_tag_prefix(config.git.tag_prefix.clone()),
    );
    let alerts: Arc<dyn AlertSink> = match &config.alert_webhook {
        Some(url) => Arc::new(WebhookAlerts::new(url.clone())),
        None => Arc::new(LogAlerts),
    };
    let agent = Arc::new(CliAgent::new(
        config.agent.command.clone(),
        config.agent.args.clone(),
    ));
    let retry = Arc::new(
        RetryController::new(
            working_dir.to_path_buf(),
            Some(agent.clone()),
            git.clone(),
            alerts,
        )
        .with_max_retries(config.retry.max_retries)
        .with_session_timeout(Duration::from_secs(config.retry.session_timeout_secs)),
    );
    let pipeline = Arc::new(ValidationPipeline::new(
        PipelineConfig {
            git_checkpoints: config.git.checkpoints_enabled,
            smoke_enabled: config.smoke_enabled,
            base_ref: config.git.base_ref.clone(),
            docker_build_command: config.docker_build_command.clone(),
            build_timeout: Duration::from_secs(config.timeouts.build_secs),
            test_timeout: Duration::from_secs(config.timeouts.test_secs),
            docker_timeout: Duration::from_secs(config.timeouts.docker_secs),
        },
        config.packages.clone(),
        config.smoke_endpoints.clone(),
        working_dir.to_path_buf(),
        git,
        retry,
    ));

    Arc::new(Orchestrator::new(
        pipeline,
        Arc::new(checkpoint_store(config, working_dir)),
        Arc::new(WorkerPool::new()),
        Some(agent),
        tracker,
        working_dir.to_path_buf(),
        config.max_concurrent,
        Duration::from_secs(config.timeouts.item_secs),
    ))
}

fn checkpoint_store(config: &OrchestratorConfig, working_dir: &Path) -> CheckpointStore {
    CheckpointStore::new(working_dir.join(&config.checkpoint.path))
        .with_max_age(chrono::Duration::hours(config.checkpoint.max_age_hours))
}

fn status(config: &OrchestratorConfig, working_dir: &Path) -> Result<()> {
    let store = checkpoint_store(config, working_dir);
    match store.load() {
        Ok(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Err(reason) => {
            println!("No usable checkpoint ({}).", reason);
        }
    }
    Ok(())
}
