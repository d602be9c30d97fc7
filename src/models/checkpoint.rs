//! Checkpoint Models
//!
//! Joint snapshots of the code revision and orchestration state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::{Agent, AgentStatus};
use super::blocker::{Blocker, BlockerStatus};
use super::context::ContextItem;
use super::correction::CorrectionAttempt;
use super::task::{Task, TaskCounts};

/// Maximum checkpoint name length in characters
pub const MAX_CHECKPOINT_NAME_LEN: usize = 100;
/// Maximum checkpoint description length in characters
pub const MAX_CHECKPOINT_DESCRIPTION_LEN: usize = 500;

/// What caused a checkpoint to be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Manual,
    Auto,
    PhaseTransition,
    Pause,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTrigger::Manual => "manual",
            CheckpointTrigger::Auto => "auto",
            CheckpointTrigger::PhaseTransition => "phase_transition",
            CheckpointTrigger::Pause => "pause",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(CheckpointTrigger::Manual),
            "auto" => Some(CheckpointTrigger::Auto),
            "phase_transition" => Some(CheckpointTrigger::PhaseTransition),
            "pause" => Some(CheckpointTrigger::Pause),
            _ => None,
        }
    }
}

/// Creation metadata recorded with each checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Lowest workflow step that still has unfinished tasks, or "complete"
    pub phase: String,
    pub tasks: TaskCounts,
    pub agents_active: u32,
    pub blockers_pending: u32,
    pub context_items: u32,
}

impl CheckpointMetadata {
    pub fn describe(state: &StateSnapshot, context: &ContextSnapshot) -> Self {
        let phase = state
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.workflow_step)
            .min()
            .map(|step| format!("step-{}", step))
            .unwrap_or_else(|| "complete".to_string());
        Self {
            phase,
            tasks: TaskCounts::from_tasks(&state.tasks),
            agents_active: state
                .agents
                .iter()
                .filter(|a| a.status != AgentStatus::Idle)
                .count() as u32,
            blockers_pending: state
                .blockers
                .iter()
                .filter(|b| b.status == BlockerStatus::Pending)
                .count() as u32,
            context_items: context.items.len() as u32,
        }
    }
}

/// A stored checkpoint; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub trigger: CheckpointTrigger,
    /// Code revision reference
    pub git_commit: String,
    /// Orchestration state snapshot, relative to the checkpoints directory
    pub state_snapshot_path: String,
    /// Context snapshot, relative to the checkpoints directory
    pub context_snapshot_path: String,
    pub snapshot_sha256: String,
    pub context_sha256: String,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when a checkpoint row is recorded
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub name: String,
    pub description: Option<String>,
    pub trigger: CheckpointTrigger,
    pub git_commit: String,
    pub state_snapshot_path: String,
    pub context_snapshot_path: String,
    pub snapshot_sha256: String,
    pub context_sha256: String,
    pub metadata: CheckpointMetadata,
}

/// Request to create a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckpointRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_trigger")]
    pub trigger: CheckpointTrigger,
}

fn default_trigger() -> CheckpointTrigger {
    CheckpointTrigger::Manual
}

impl CreateCheckpointRequest {
    pub fn manual(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger: CheckpointTrigger::Manual,
        }
    }

    /// Validate name and description lengths
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("Checkpoint name cannot be empty".to_string());
        }
        if name.chars().count() > MAX_CHECKPOINT_NAME_LEN {
            return Err(format!(
                "Checkpoint name cannot exceed {} characters",
                MAX_CHECKPOINT_NAME_LEN
            ));
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_CHECKPOINT_DESCRIPTION_LEN {
                return Err(format!(
                    "Checkpoint description cannot exceed {} characters",
                    MAX_CHECKPOINT_DESCRIPTION_LEN
                ));
            }
        }
        Ok(())
    }
}

/// Orchestration state captured by a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub blockers: Vec<Blocker>,
    pub correction_attempts: Vec<CorrectionAttempt>,
}

/// Context cache captured by a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub items: Vec<ContextItem>,
}

/// Differences between a checkpoint and the current state, for review before restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub checkpoint_id: i64,
    pub git_commit: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    /// Tasks whose status differs from the snapshot
    pub tasks_changed: u32,
}

/// Result of a restore request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub checkpoint_id: i64,
    /// False when the request was not confirmed and only the preview was computed
    pub restored: bool,
    pub diff: CheckpointDiff,
    /// Revision committed just before the restore, present when restored
    pub safety_revision: Option<String>,
}
