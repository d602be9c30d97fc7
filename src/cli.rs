//! Operator command line.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conductor::models::{
    BlockerFilter, BlockerStatus, BlockerType, CheckpointTrigger, CreateCheckpointRequest,
};
use conductor::services::checkpoint::GitBackend;
use conductor::storage::ConfigService;
use conductor::utils::paths::ensure_checkpoints_dir;
use conductor::AppState;
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Dependency-aware orchestration for a pool of code-generating agents"
)]
pub struct Cli {
    /// Project root holding `.conductor/`
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Log orchestration progress to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create `.conductor/` with a default config and a git repository if missing.
    Init,
    /// Add the tasks of a `{"tasks": [...]}` plan file. Fails on cycles.
    Plan { file: PathBuf },
    /// Run the agent pool until no task is ready or running, or Ctrl-C.
    Run,
    /// Task counts, agents and blocker metrics.
    Status,
    /// Cancel a task that has not finished.
    Cancel { task_id: i64 },
    /// Human-in-the-loop questions.
    #[command(subcommand)]
    Blockers(BlockersCommand),
    /// Joint code and state snapshots.
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
}

#[derive(Subcommand)]
pub enum BlockersCommand {
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<BlockerStatus>,
        #[arg(long = "type", value_parser = parse_type)]
        blocker_type: Option<BlockerType>,
    },
    Show { id: i64 },
    Resolve { id: i64, answer: String },
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_parser = parse_trigger, default_value = "manual")]
        trigger: CheckpointTrigger,
    },
    List,
    Diff { id: i64 },
    /// Without --confirm only the diff preview is shown.
    Restore {
        id: i64,
        #[arg(long)]
        confirm: bool,
    },
}

fn parse_status(s: &str) -> Result<BlockerStatus, String> {
    BlockerStatus::from_str(s).ok_or_else(|| format!("unknown blocker status '{}'", s))
}

fn parse_type(s: &str) -> Result<BlockerType, String> {
    BlockerType::from_str(s).ok_or_else(|| format!("unknown blocker type '{}'", s))
}

fn parse_trigger(s: &str) -> Result<CheckpointTrigger, String> {
    CheckpointTrigger::from_str(s).ok_or_else(|| format!("unknown trigger '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn open(project: &Path) -> Result<AppState> {
    AppState::open(project).with_context(|| format!("open project {}", project.display()))
}

pub async fn execute(cli: Cli) -> Result<()> {
    let project = cli.project;
    match cli.command {
        Command::Init => {
            ConfigService::load_or_create(&project).context("create config")?;
            ensure_checkpoints_dir(&project).context("create checkpoints directory")?;
            GitBackend::open_or_init(&project).context("prepare git repository")?;
            open(&project)?;
            println!("Initialized {}", project.join(".conductor").display());
        }
        Command::Plan { file } => {
            let state = open(&project)?;
            let tasks = state
                .load_plan(&file)
                .with_context(|| format!("load plan {}", file.display()))?;
            println!("Added {} task(s)", tasks.len());
        }
        Command::Run => {
            let state = open(&project)?;
            let shutdown = state.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping the pool");
                    shutdown.cancel();
                }
            });
            let summary = state.run().await.context("run agent pool")?;
            print_json(&summary)?;
        }
        Command::Status => print_json(&open(&project)?.status()?)?,
        Command::Cancel { task_id } => {
            let state = open(&project)?;
            match state.pool().cancel_task(task_id)? {
                Some(task) => println!("Task {} {}", task.id, task.status),
                None => bail!("task {} is already finished", task_id),
            }
        }
        Command::Blockers(command) => blockers(&open(&project)?, command)?,
        Command::Checkpoint(command) => checkpoint(&open(&project)?, command)?,
    }
    Ok(())
}

fn blockers(state: &AppState, command: BlockersCommand) -> Result<()> {
    let coordinator = state.blockers();
    match command {
        BlockersCommand::List {
            status,
            blocker_type,
        } => {
            let filter = BlockerFilter {
                status,
                blocker_type,
                task_id: None,
            };
            for b in coordinator.list(&filter)? {
                println!(
                    "#{:<4} {:<8} {:<5} task {:<4} {}",
                    b.id,
                    b.status.as_str(),
                    b.blocker_type.as_str(),
                    b.task_id,
                    b.question
                );
            }
        }
        BlockersCommand::Show { id } => print_json(&coordinator.get(id)?)?,
        BlockersCommand::Resolve { id, answer } => {
            let blocker = coordinator
                .resolve(id, &answer)
                .with_context(|| format!("resolve blocker {}", id))?;
            println!("Blocker {} resolved for task {}", blocker.id, blocker.task_id);
        }
    }
    Ok(())
}

fn checkpoint(state: &AppState, command: CheckpointCommand) -> Result<()> {
    let manager = state.checkpoints();
    match command {
        CheckpointCommand::Create {
            name,
            description,
            trigger,
        } => {
            let checkpoint = manager.create(CreateCheckpointRequest {
                name,
                description,
                trigger,
            })?;
            println!("Checkpoint {} at {}", checkpoint.id, checkpoint.git_commit);
        }
        CheckpointCommand::List => {
            for c in manager.list()? {
                println!(
                    "#{:<4} {} {:<16} {} {}",
                    c.id,
                    c.created_at.format("%Y-%m-%d %H:%M:%S"),
                    c.trigger.as_str(),
                    &c.git_commit[..c.git_commit.len().min(10)],
                    c.name
                );
            }
        }
        CheckpointCommand::Diff { id } => print_json(&manager.diff(id)?)?,
        CheckpointCommand::Restore { id, confirm } => {
            let outcome = manager
                .restore(id, confirm)
                .with_context(|| format!("restore checkpoint {}", id))?;
            print_json(&outcome)?;
            if !outcome.restored {
                eprintln!("Preview only; pass --confirm to restore.");
            }
        }
    }
    Ok(())
}
