//! Application State
//!
//! Builds and owns every orchestration service for one project. The CLI and
//! the integration tests go through this type.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{CodeGenerator, TestRunner, VersionControl};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::{
    BlockerMetrics, CorrectionAttempt, OrchestratorConfig, PlanFile, PoolStatus, Task,
    TaskCounts, TaskSpec, TaskStatus,
};
use crate::services::blockers::{BlockerCoordinator, BlockerSettings};
use crate::services::checkpoint::{CheckpointManager, GitBackend};
use crate::services::context::TierBudgets;
use crate::services::correction::SelfCorrectionLoop;
use crate::services::pool::{AgentPool, AgentRegistry, RunSummary};
use crate::services::providers::{CommandCodeGenerator, ShellTestRunner, UnconfiguredGenerator};
use crate::services::scheduler::Scheduler;
use crate::services::sync::Broadcaster;
use crate::services::worker::{ContextLimits, GenerationClient, WorkerServices};
use crate::storage::{ConfigService, Database};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::checkpoints_dir;

/// The external services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn CodeGenerator>,
    pub tests: Arc<dyn TestRunner>,
    pub vcs: Arc<dyn VersionControl>,
}

impl Collaborators {
    /// Command-backed adapters as configured for the project
    pub fn from_config(project_root: &Path, config: &OrchestratorConfig) -> AppResult<Self> {
        let generator: Arc<dyn CodeGenerator> = match &config.generator_command {
            Some(command) => Arc::new(CommandCodeGenerator::new(command, project_root)?),
            None => Arc::new(UnconfiguredGenerator),
        };
        Ok(Self {
            generator,
            tests: Arc::new(ShellTestRunner::from_config(config)?),
            vcs: Arc::new(GitBackend::new(project_root)),
        })
    }
}

/// Point-in-time summary for `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub tasks: TaskCounts,
    pub pool: PoolStatus,
    pub blockers: BlockerMetrics,
    /// Failed tasks, in id order
    pub failed: Vec<FailedTask>,
}

/// A failed task with every correction attempt made on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: i64,
    pub title: String,
    pub error: Option<String>,
    pub attempts: Vec<CorrectionAttempt>,
}

pub struct AppState {
    project_root: PathBuf,
    config: OrchestratorConfig,
    db: Database,
    broadcaster: Broadcaster,
    scheduler: Arc<Scheduler>,
    blockers: Arc<BlockerCoordinator>,
    correction: Arc<SelfCorrectionLoop>,
    registry: Arc<AgentRegistry>,
    pool: Arc<AgentPool>,
    checkpoints: Arc<CheckpointManager>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Open the project's state directory with the configured adapters
    pub fn open(project_root: &Path) -> AppResult<Self> {
        let config = ConfigService::load_or_create(project_root)?
            .get_config()
            .clone();
        let collaborators = Collaborators::from_config(project_root, &config)?;
        let db = Database::open_project(project_root)?;
        Self::build(project_root, config, db, collaborators)
    }

    /// Wire every service over an existing store.
    ///
    /// Opening never changes stored state, so any number of processes may open
    /// a project while one of them runs it. A cyclic stored graph fails here.
    pub fn build(
        project_root: &Path,
        config: OrchestratorConfig,
        db: Database,
        collaborators: Collaborators,
    ) -> AppResult<Self> {
        config.validate().map_err(AppError::config)?;

        let broadcaster = Broadcaster::new(db.clone());
        let scheduler = Arc::new(Scheduler::load(db.clone(), broadcaster.clone())?);

        let wakeup = Arc::new(Notify::new());
        let blockers = Arc::new(BlockerCoordinator::new(
            db.clone(),
            Arc::clone(&scheduler),
            broadcaster.clone(),
            BlockerSettings::from_config(&config),
            Arc::clone(&wakeup),
        ));
        let generation = GenerationClient::from_config(collaborators.generator, &config);
        let correction = Arc::new(SelfCorrectionLoop::from_config(
            db.clone(),
            broadcaster.clone(),
            Arc::clone(&blockers),
            generation.clone(),
            Arc::clone(&collaborators.tests),
            &config,
        ));
        let registry = Arc::new(AgentRegistry::load(
            db.clone(),
            broadcaster.clone(),
            config.max_agents,
            TierBudgets::from_config(&config),
        )?);

        let shutdown = CancellationToken::new();
        let services = WorkerServices {
            scheduler: Arc::clone(&scheduler),
            blockers: Arc::clone(&blockers),
            correction: Arc::clone(&correction),
            generation,
            tests: collaborators.tests,
            project_root: project_root.to_path_buf(),
            limits: ContextLimits::from_config(&config),
            shutdown: shutdown.clone(),
        };
        let pool = Arc::new(AgentPool::new(
            db.clone(),
            services,
            Arc::clone(&registry),
            wakeup,
            Duration::from_secs(config.blocker_sweep_interval_secs),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            db.clone(),
            collaborators.vcs,
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            broadcaster.clone(),
            checkpoints_dir(project_root),
        ));

        Ok(Self {
            project_root: project_root.to_path_buf(),
            config,
            db,
            broadcaster,
            scheduler,
            blockers,
            correction,
            registry,
            pool,
            checkpoints,
            shutdown,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn blockers(&self) -> &Arc<BlockerCoordinator> {
        &self.blockers
    }

    pub fn correction(&self) -> &Arc<SelfCorrectionLoop> {
        &self.correction
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Token that stops `run`; cancelling it requeues running tasks
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn plan(&self, specs: Vec<TaskSpec>) -> AppResult<Vec<Task>> {
        self.scheduler.plan(specs)
    }

    /// Load a `{"tasks": [...]}` plan file
    pub fn load_plan(&self, path: &Path) -> AppResult<Vec<Task>> {
        let content = std::fs::read_to_string(path)?;
        let plan: PlanFile = serde_json::from_str(&content)
            .map_err(|e| AppError::validation(format!("{}: {}", path.display(), e)))?;
        self.plan(plan.tasks)
    }

    /// Run the pool until nothing is ready or running, or until shutdown
    pub async fn run(&self) -> AppResult<RunSummary> {
        self.pool.run().await
    }

    pub fn status(&self) -> AppResult<StatusReport> {
        let mut failed = Vec::new();
        for task in self.scheduler.tasks()? {
            if task.status != TaskStatus::Failed {
                continue;
            }
            failed.push(FailedTask {
                attempts: self.correction.history(task.id)?,
                task_id: task.id,
                title: task.title,
                error: task.error,
            });
        }
        failed.sort_by_key(|f| f.task_id);
        Ok(StatusReport {
            tasks: self.scheduler.counts()?,
            pool: self.pool.agent_status()?,
            blockers: self.blockers.metrics()?,
            failed,
        })
    }
}
