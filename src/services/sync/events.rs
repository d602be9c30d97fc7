//! Sync Event Definitions
//!
//! Lifecycle events pushed to observers. Wire shape:
//! `{event_type, entity_id, timestamp, ...entity-specific fields}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    AgentStatus, AgentType, BlockerType, CorrectionOutcome, TaskCounts, TaskStatus,
};

/// Entity id used by project-wide events
pub const PROJECT_ENTITY_ID: &str = "project";

/// Which kind of entity an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Task,
    Agent,
    Blocker,
    Project,
}

/// Entity-specific payload, tagged by `event_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SyncEventKind {
    TaskAssigned {
        agent_id: String,
    },
    TaskStatusChanged {
        status: TaskStatus,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskBlocked {
        blocked_by: Vec<i64>,
    },
    TaskUnblocked {
        status: TaskStatus,
    },
    TaskProgress {
        progress: u8,
    },
    AgentCreated {
        agent_type: AgentType,
    },
    AgentUpdated {
        status: AgentStatus,
        current_task: Option<i64>,
        tasks_completed: u32,
        context_token_usage: u64,
    },
    AgentRetired,
    BlockerCreated {
        task_id: i64,
        blocker_type: BlockerType,
        question: String,
    },
    BlockerResolved {
        task_id: i64,
        answer: String,
    },
    BlockerExpired {
        task_id: i64,
    },
    ProgressUpdated {
        completed: u32,
        total: u32,
        percentage: f64,
    },
    CorrectionAttempt {
        task_id: i64,
        attempt_number: u32,
        outcome: CorrectionOutcome,
    },
    /// The whole state was replaced from a checkpoint
    StateRestored {
        checkpoint_id: i64,
        epoch: u64,
    },
}

impl SyncEventKind {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            SyncEventKind::TaskAssigned { .. }
            | SyncEventKind::TaskStatusChanged { .. }
            | SyncEventKind::TaskBlocked { .. }
            | SyncEventKind::TaskUnblocked { .. }
            | SyncEventKind::TaskProgress { .. }
            | SyncEventKind::CorrectionAttempt { .. } => EntityKind::Task,
            SyncEventKind::AgentCreated { .. }
            | SyncEventKind::AgentUpdated { .. }
            | SyncEventKind::AgentRetired => EntityKind::Agent,
            SyncEventKind::BlockerCreated { .. }
            | SyncEventKind::BlockerResolved { .. }
            | SyncEventKind::BlockerExpired { .. } => EntityKind::Blocker,
            SyncEventKind::ProgressUpdated { .. } | SyncEventKind::StateRestored { .. } => {
                EntityKind::Project
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEventKind::TaskAssigned { .. } => "task_assigned",
            SyncEventKind::TaskStatusChanged { .. } => "task_status_changed",
            SyncEventKind::TaskBlocked { .. } => "task_blocked",
            SyncEventKind::TaskUnblocked { .. } => "task_unblocked",
            SyncEventKind::TaskProgress { .. } => "task_progress",
            SyncEventKind::AgentCreated { .. } => "agent_created",
            SyncEventKind::AgentUpdated { .. } => "agent_updated",
            SyncEventKind::AgentRetired => "agent_retired",
            SyncEventKind::BlockerCreated { .. } => "blocker_created",
            SyncEventKind::BlockerResolved { .. } => "blocker_resolved",
            SyncEventKind::BlockerExpired { .. } => "blocker_expired",
            SyncEventKind::ProgressUpdated { .. } => "progress_updated",
            SyncEventKind::CorrectionAttempt { .. } => "correction_attempt",
            SyncEventKind::StateRestored { .. } => "state_restored",
        }
    }
}

/// One discrete lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SyncEventKind,
}

impl SyncEvent {
    pub fn new(entity_id: impl Into<String>, kind: SyncEventKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Stamp the event with the time its change was committed
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn task(task_id: i64, kind: SyncEventKind) -> Self {
        Self::new(task_id.to_string(), kind)
    }

    pub fn agent(agent_id: &str, kind: SyncEventKind) -> Self {
        Self::new(agent_id, kind)
    }

    pub fn blocker(blocker_id: i64, kind: SyncEventKind) -> Self {
        Self::new(blocker_id.to_string(), kind)
    }

    pub fn project_progress(counts: &TaskCounts) -> Self {
        Self::new(
            PROJECT_ENTITY_ID,
            SyncEventKind::ProgressUpdated {
                completed: counts.completed,
                total: counts.total,
                percentage: counts.completion_percentage(),
            },
        )
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}
