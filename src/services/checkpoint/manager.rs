//! Checkpoint Manager
//!
//! A checkpoint joins a code revision with a snapshot of the orchestration
//! state and the context cache. Snapshot files live under
//! `.conductor/checkpoints/` with SHA-256 hashes recorded in the store.
//!
//! Restore is two-phase (code, then state) and all-or-nothing: a failure in
//! either phase puts back whatever the earlier phase changed, leaving the
//! system as it was before the restore.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use conductor_core::VersionControl;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{
    Checkpoint, CheckpointDiff, CheckpointMetadata, ContextSnapshot, CreateCheckpointRequest,
    NewCheckpoint, RestoreOutcome, StateSnapshot, TaskStatus,
};
use crate::services::pool::{AgentRegistry, RunLease};
use crate::services::scheduler::Scheduler;
use crate::services::sync::{Broadcaster, SyncEventKind};
use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

const STATE_SUFFIX: &str = "state.json";
const CONTEXT_SUFFIX: &str = "context.json";

pub struct CheckpointManager {
    db: Database,
    vcs: Arc<dyn VersionControl>,
    scheduler: Arc<Scheduler>,
    registry: Arc<AgentRegistry>,
    broadcaster: Broadcaster,
    checkpoints_dir: PathBuf,
    /// Serializes create / delete / restore
    op_lock: Mutex<()>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Snapshot paths are stored relative to the checkpoints directory and may
/// only name a plain file inside it.
fn validate_snapshot_path(relative: &str) -> AppResult<()> {
    let path = Path::new(relative);
    let plain = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(AppError::restore_integrity(format!(
            "snapshot path '{}' escapes the checkpoints directory",
            relative
        )));
    }
    Ok(())
}

impl CheckpointManager {
    pub fn new(
        db: Database,
        vcs: Arc<dyn VersionControl>,
        scheduler: Arc<Scheduler>,
        registry: Arc<AgentRegistry>,
        broadcaster: Broadcaster,
        checkpoints_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            vcs,
            scheduler,
            registry,
            broadcaster,
            checkpoints_dir: checkpoints_dir.into(),
            op_lock: Mutex::new(()),
        }
    }

    fn exclusive(&self) -> AppResult<MutexGuard<'_, ()>> {
        self.op_lock
            .lock()
            .map_err(|_| AppError::internal("checkpoint lock poisoned"))
    }

    // ========================================================================
    // Create / read / delete
    // ========================================================================

    /// Commit the working tree and snapshot the orchestration state.
    pub fn create(&self, request: CreateCheckpointRequest) -> AppResult<Checkpoint> {
        request.validate().map_err(AppError::validation)?;
        let _guard = self.exclusive()?;

        let state = self.db.export_state()?;
        let context = self.db.export_context()?;
        let name = request.name.trim().to_string();
        let git_commit = self
            .vcs
            .commit_all(&format!("conductor checkpoint: {}", name))?;

        std::fs::create_dir_all(&self.checkpoints_dir)?;
        let stem = self.unique_stem();
        let state_path = format!("{}.{}", stem, STATE_SUFFIX);
        let context_path = format!("{}.{}", stem, CONTEXT_SUFFIX);
        let snapshot_sha256 = self.write_snapshot(&state_path, &state)?;
        let context_sha256 = match self.write_snapshot(&context_path, &context) {
            Ok(hash) => hash,
            Err(e) => {
                self.remove_files(&[&state_path]);
                return Err(e);
            }
        };

        let record = NewCheckpoint {
            name,
            description: request.description,
            trigger: request.trigger,
            git_commit,
            state_snapshot_path: state_path.clone(),
            context_snapshot_path: context_path.clone(),
            snapshot_sha256,
            context_sha256,
            metadata: CheckpointMetadata::describe(&state, &context),
        };
        let checkpoint = match self.db.insert_checkpoint(&record) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.remove_files(&[&state_path, &context_path]);
                return Err(e);
            }
        };

        tracing::info!(
            checkpoint_id = checkpoint.id,
            name = %checkpoint.name,
            trigger = checkpoint.trigger.as_str(),
            git_commit = %checkpoint.git_commit,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Newest first
    pub fn list(&self) -> AppResult<Vec<Checkpoint>> {
        self.db.list_checkpoints()
    }

    pub fn get(&self, checkpoint_id: i64) -> AppResult<Checkpoint> {
        self.db
            .get_checkpoint(checkpoint_id)?
            .ok_or_else(|| AppError::not_found(format!("Checkpoint {} not found", checkpoint_id)))
    }

    /// Delete the record and its snapshot files. The code revision is left
    /// in the repository history.
    pub fn delete(&self, checkpoint_id: i64) -> AppResult<bool> {
        let _guard = self.exclusive()?;
        let Some(checkpoint) = self.db.get_checkpoint(checkpoint_id)? else {
            return Ok(false);
        };
        let deleted = self.db.delete_checkpoint(checkpoint_id)?;
        if deleted {
            let paths: Vec<&str> = [&checkpoint.state_snapshot_path, &checkpoint.context_snapshot_path]
                .into_iter()
                .filter(|p| validate_snapshot_path(p).is_ok())
                .map(String::as_str)
                .collect();
            self.remove_files(&paths);
            tracing::info!(checkpoint_id, "Checkpoint deleted");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Diff / restore
    // ========================================================================

    /// Code and task-status differences between the checkpoint and now
    pub fn diff(&self, checkpoint_id: i64) -> AppResult<CheckpointDiff> {
        let checkpoint = self.get(checkpoint_id)?;
        let state: StateSnapshot = self.read_snapshot(
            &checkpoint.state_snapshot_path,
            &checkpoint.snapshot_sha256,
        )?;
        self.compute_diff(&checkpoint, &state)
    }

    fn compute_diff(&self, checkpoint: &Checkpoint, state: &StateSnapshot) -> AppResult<CheckpointDiff> {
        let stats = self.vcs.diff_stats(&checkpoint.git_commit)?;

        let then: HashMap<i64, TaskStatus> = state.tasks.iter().map(|t| (t.id, t.status)).collect();
        let now: HashMap<i64, TaskStatus> = self
            .db
            .list_tasks()?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        let mut tasks_changed = then
            .iter()
            .filter(|(id, status)| now.get(id) != Some(status))
            .count();
        tasks_changed += now.keys().filter(|id| !then.contains_key(id)).count();

        Ok(CheckpointDiff {
            checkpoint_id: checkpoint.id,
            git_commit: checkpoint.git_commit.clone(),
            files_changed: stats.files_changed,
            insertions: stats.insertions,
            deletions: stats.deletions,
            tasks_changed: tasks_changed as u32,
        })
    }

    /// Roll code, orchestration state and context back to a checkpoint.
    ///
    /// Without `confirm` nothing changes and only the diff preview is returned.
    /// Refused while a run holds the project lease (including one whose
    /// workers are only waiting on SYNC blockers) or while any execution is
    /// still attached to a task. Snapshot integrity is verified before
    /// anything is touched; the current tree is committed first so the code
    /// phase can be undone.
    pub fn restore(&self, checkpoint_id: i64, confirm: bool) -> AppResult<RestoreOutcome> {
        let _guard = self.exclusive()?;
        let checkpoint = self.get(checkpoint_id)?;
        let state: StateSnapshot = self.read_snapshot(
            &checkpoint.state_snapshot_path,
            &checkpoint.snapshot_sha256,
        )?;
        let context: ContextSnapshot = self.read_snapshot(
            &checkpoint.context_snapshot_path,
            &checkpoint.context_sha256,
        )?;
        let diff = self.compute_diff(&checkpoint, &state)?;

        if !confirm {
            return Ok(RestoreOutcome {
                checkpoint_id,
                restored: false,
                diff,
                safety_revision: None,
            });
        }

        if let Some(holder) = RunLease::active(&self.db)? {
            return Err(AppError::conflict(format!(
                "cannot restore checkpoint {} while run {} is active",
                checkpoint_id, holder
            )));
        }
        // Held until the restore ends so no run can start halfway through
        let _lease = RunLease::acquire(&self.db, "restore")?;

        let attached = self
            .db
            .list_tasks()?
            .into_iter()
            .filter(|t| {
                !t.status.is_terminal()
                    && (t.status == TaskStatus::InProgress || t.assigned_agent.is_some())
            })
            .count();
        if attached > 0 || self.registry.working_count()? > 0 {
            return Err(AppError::conflict(format!(
                "cannot restore checkpoint {} while {} task(s) are still attached to an agent; \
                 run the project once to recover them",
                checkpoint_id, attached
            )));
        }

        let previous_state = self.db.export_state()?;
        let previous_context = self.db.export_context()?;
        let safety = self.vcs.commit_all(&format!(
            "conductor: before restoring checkpoint {}",
            checkpoint_id
        ))?;

        // Phase 1: code
        if let Err(e) = self.vcs.reset_hard(&checkpoint.git_commit) {
            self.undo_code(&safety);
            return Err(AppError::restore_integrity(format!(
                "code restore to {} failed: {}",
                checkpoint.git_commit, e
            )));
        }

        // Phase 2: state and context, in one exclusive transaction
        let epoch = match self.db.import_state(&state, &context) {
            Ok(epoch) => epoch,
            Err(e) => {
                self.undo_code(&safety);
                return Err(AppError::restore_integrity(format!(
                    "state restore failed: {}",
                    e
                )));
            }
        };

        if let Err(e) = self.reload() {
            tracing::error!(checkpoint_id, error = %e, "Reload after restore failed, rolling back");
            if let Err(undo) = self.db.import_state(&previous_state, &previous_context) {
                tracing::error!(error = %undo, "Failed to put back previous state");
            }
            if let Err(undo) = self.reload() {
                tracing::error!(error = %undo, "Failed to reload previous state");
            }
            self.undo_code(&safety);
            return Err(AppError::restore_integrity(format!(
                "restored state could not be loaded: {}",
                e
            )));
        }

        // Observers drop their cache before any restored row is announced
        self.broadcaster.state_restored(checkpoint_id, epoch);
        for task in self.db.list_tasks()? {
            self.broadcaster.task_at(
                task.id,
                task.updated_at,
                SyncEventKind::TaskStatusChanged {
                    status: task.status,
                    progress: task.progress,
                    error: task.error.clone(),
                },
            );
        }
        self.broadcaster.project_progress();

        tracing::info!(
            checkpoint_id,
            epoch,
            git_commit = %checkpoint.git_commit,
            safety_revision = %safety,
            "Checkpoint restored"
        );
        Ok(RestoreOutcome {
            checkpoint_id,
            restored: true,
            diff,
            safety_revision: Some(safety),
        })
    }

    fn reload(&self) -> AppResult<()> {
        self.scheduler.reload()?;
        self.registry.reload()?;
        // Restored rows may name executions that no longer exist
        let requeued = self.scheduler.recover_interrupted()?;
        if !requeued.is_empty() {
            tracing::info!(tasks = ?requeued, "Requeued tasks restored as in progress");
        }
        self.registry.recover()?;
        Ok(())
    }

    fn undo_code(&self, safety: &str) {
        if let Err(e) = self.vcs.reset_hard(safety) {
            tracing::error!(safety_revision = safety, error = %e, "Failed to roll code back");
        }
    }

    // ========================================================================
    // Snapshot files
    // ========================================================================

    fn unique_stem(&self) -> String {
        let base = format!("checkpoint-{}", Utc::now().format("%Y%m%dT%H%M%S%.9f"));
        let mut stem = base.clone();
        let mut n = 1;
        while self
            .checkpoints_dir
            .join(format!("{}.{}", stem, STATE_SUFFIX))
            .exists()
        {
            n += 1;
            stem = format!("{}-{}", base, n);
        }
        stem
    }

    /// Write atomically (temp file + rename) and return the content hash
    fn write_snapshot<T: Serialize>(&self, relative: &str, value: &T) -> AppResult<String> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.checkpoints_dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.checkpoints_dir.join(relative))
            .map_err(|e| AppError::Io(e.error))?;
        Ok(sha256_hex(&bytes))
    }

    fn read_snapshot<T: DeserializeOwned>(&self, relative: &str, expected_sha256: &str) -> AppResult<T> {
        validate_snapshot_path(relative)?;
        let path = self.checkpoints_dir.join(relative);
        let bytes = std::fs::read(&path).map_err(|e| {
            AppError::restore_integrity(format!("cannot read snapshot {}: {}", path.display(), e))
        })?;
        let actual = sha256_hex(&bytes);
        if actual != expected_sha256 {
            return Err(AppError::restore_integrity(format!(
                "snapshot {} hash mismatch (expected {}, found {})",
                relative, expected_sha256, actual
            )));
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            AppError::restore_integrity(format!("snapshot {} is not readable: {}", relative, e))
        })
    }

    fn remove_files(&self, relative: &[&str]) {
        for path in relative {
            let path = self.checkpoints_dir.join(path);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove snapshot file");
                }
            }
        }
    }
}
