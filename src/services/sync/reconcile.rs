//! Observer-side Reconciliation
//!
//! Cached view of orchestration state kept by an observer. Concurrent updates
//! for the same entity are reconciled last-write-wins by timestamp, never by
//! delivery order:
//!
//! - an event replaces the cached entity when its timestamp is >= the cached one
//! - a resync entry replaces it only when strictly newer
//!
//! Timestamps only compare within one state epoch. A restore starts a new
//! epoch and the cache is rebuilt from scratch, since restored rows carry
//! older timestamps than what the observer saw before.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{
    Agent, AgentStatus, AgentType, Blocker, BlockerStatus, BlockerType, Task, TaskStatus,
};

use super::broadcaster::{ResyncPayload, SyncMessage};
use super::events::{SyncEvent, SyncEventKind};

#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub status: TaskStatus,
    pub progress: u8,
    pub assigned_agent: Option<String>,
    pub blocked_by: Vec<i64>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
            assigned_agent: task.assigned_agent.clone(),
            blocked_by: task.blocked_by.iter().copied().collect(),
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentView {
    pub agent_type: Option<AgentType>,
    pub status: AgentStatus,
    pub current_task: Option<i64>,
    pub tasks_completed: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&Agent> for AgentView {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_type: Some(agent.agent_type),
            status: agent.status,
            current_task: agent.current_task,
            tasks_completed: agent.tasks_completed,
            updated_at: agent.last_update,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockerView {
    pub task_id: i64,
    pub blocker_type: Option<BlockerType>,
    pub status: BlockerStatus,
    pub question: Option<String>,
    pub answer: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Blocker> for BlockerView {
    fn from(blocker: &Blocker) -> Self {
        Self {
            task_id: blocker.task_id,
            blocker_type: Some(blocker.blocker_type),
            status: blocker.status,
            question: Some(blocker.question.clone()),
            answer: blocker.answer.clone(),
            updated_at: blocker.last_changed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectProgress {
    pub completed: u32,
    pub total: u32,
    pub percentage: f64,
    pub updated_at: DateTime<Utc>,
}

/// An observer's local cache
#[derive(Debug, Default)]
pub struct ObserverState {
    pub epoch: u64,
    pub tasks: HashMap<i64, TaskView>,
    pub agents: HashMap<String, AgentView>,
    pub blockers: HashMap<i64, BlockerView>,
    pub progress: Option<ProjectProgress>,
}

impl ObserverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &SyncMessage) {
        match message {
            SyncMessage::Event(event) => {
                self.apply_event(event);
            }
            SyncMessage::Resync(payload) => self.apply_resync(payload),
        }
    }

    /// Apply one event; returns false when a newer cached value won.
    pub fn apply_event(&mut self, event: &SyncEvent) -> bool {
        let ts = event.timestamp;
        match &event.kind {
            SyncEventKind::TaskAssigned { agent_id } => {
                self.task_entry(&event.entity_id, ts, |view| {
                    view.assigned_agent = Some(agent_id.clone());
                })
            }
            SyncEventKind::TaskStatusChanged {
                status, progress, ..
            } => self.task_entry(&event.entity_id, ts, |view| {
                view.status = *status;
                view.progress = *progress;
                if status.is_terminal() {
                    view.assigned_agent = None;
                    view.blocked_by.clear();
                }
            }),
            SyncEventKind::TaskBlocked { blocked_by } => {
                self.task_entry(&event.entity_id, ts, |view| {
                    view.status = TaskStatus::Blocked;
                    view.blocked_by = blocked_by.clone();
                })
            }
            SyncEventKind::TaskUnblocked { status } => {
                self.task_entry(&event.entity_id, ts, |view| {
                    view.status = *status;
                    view.blocked_by.clear();
                })
            }
            SyncEventKind::TaskProgress { progress } => {
                self.task_entry(&event.entity_id, ts, |view| view.progress = *progress)
            }
            // Attempts are history, not entity state
            SyncEventKind::CorrectionAttempt { .. } => false,
            SyncEventKind::StateRestored { epoch, .. } => self.enter_epoch(*epoch),
            SyncEventKind::AgentCreated { agent_type } => {
                self.agent_entry(&event.entity_id, ts, |view| {
                    view.agent_type = Some(*agent_type);
                })
            }
            SyncEventKind::AgentUpdated {
                status,
                current_task,
                tasks_completed,
                ..
            } => self.agent_entry(&event.entity_id, ts, |view| {
                view.status = *status;
                view.current_task = *current_task;
                view.tasks_completed = *tasks_completed;
            }),
            SyncEventKind::AgentRetired => {
                let newer_cached = self
                    .agents
                    .get(&event.entity_id)
                    .is_some_and(|view| view.updated_at > ts);
                if newer_cached {
                    return false;
                }
                self.agents.remove(&event.entity_id);
                true
            }
            SyncEventKind::BlockerCreated {
                task_id,
                blocker_type,
                question,
            } => self.blocker_entry(&event.entity_id, *task_id, ts, |view| {
                view.blocker_type = Some(*blocker_type);
                view.question = Some(question.clone());
            }),
            SyncEventKind::BlockerResolved { task_id, answer } => {
                self.blocker_entry(&event.entity_id, *task_id, ts, |view| {
                    view.status = BlockerStatus::Resolved;
                    view.answer = Some(answer.clone());
                })
            }
            SyncEventKind::BlockerExpired { task_id } => {
                self.blocker_entry(&event.entity_id, *task_id, ts, |view| {
                    view.status = BlockerStatus::Expired;
                })
            }
            SyncEventKind::ProgressUpdated {
                completed,
                total,
                percentage,
            } => {
                if self.progress.is_some_and(|p| p.updated_at > ts) {
                    return false;
                }
                self.progress = Some(ProjectProgress {
                    completed: *completed,
                    total: *total,
                    percentage: *percentage,
                    updated_at: ts,
                });
                true
            }
        }
    }

    /// Overwrite cached entities from a full resync.
    ///
    /// Entries newer in the payload replace cached ones; entities absent from
    /// the payload no longer exist and are dropped.
    pub fn apply_resync(&mut self, payload: &ResyncPayload) {
        self.enter_epoch(payload.epoch);

        let mut tasks = HashMap::with_capacity(payload.tasks.len());
        for task in &payload.tasks {
            let view = match self.tasks.remove(&task.id) {
                Some(cached) if cached.updated_at >= task.updated_at => cached,
                _ => TaskView::from(task),
            };
            tasks.insert(task.id, view);
        }
        self.tasks = tasks;

        let mut agents = HashMap::with_capacity(payload.agents.len());
        for agent in &payload.agents {
            let view = match self.agents.remove(&agent.id) {
                Some(cached) if cached.updated_at >= agent.last_update => cached,
                _ => AgentView::from(agent),
            };
            agents.insert(agent.id.clone(), view);
        }
        self.agents = agents;

        let mut blockers = HashMap::with_capacity(payload.blockers.len());
        for blocker in &payload.blockers {
            let view = match self.blockers.remove(&blocker.id) {
                Some(cached) if cached.updated_at >= blocker.last_changed() => cached,
                _ => BlockerView::from(blocker),
            };
            blockers.insert(blocker.id, view);
        }
        self.blockers = blockers;
    }

    /// Drop the whole cache when `epoch` differs from the current one
    fn enter_epoch(&mut self, epoch: u64) -> bool {
        if epoch == self.epoch {
            return false;
        }
        self.tasks.clear();
        self.agents.clear();
        self.blockers.clear();
        self.progress = None;
        self.epoch = epoch;
        true
    }

    fn task_entry(
        &mut self,
        entity_id: &str,
        ts: DateTime<Utc>,
        update: impl FnOnce(&mut TaskView),
    ) -> bool {
        let Ok(task_id) = entity_id.parse::<i64>() else {
            return false;
        };
        let view = self.tasks.entry(task_id).or_insert_with(|| TaskView {
            status: TaskStatus::Pending,
            progress: 0,
            assigned_agent: None,
            blocked_by: Vec::new(),
            updated_at: ts,
        });
        if view.updated_at > ts {
            return false;
        }
        update(view);
        view.updated_at = ts;
        true
    }

    fn agent_entry(
        &mut self,
        agent_id: &str,
        ts: DateTime<Utc>,
        update: impl FnOnce(&mut AgentView),
    ) -> bool {
        let view = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentView {
                agent_type: None,
                status: AgentStatus::Idle,
                current_task: None,
                tasks_completed: 0,
                updated_at: ts,
            });
        if view.updated_at > ts {
            return false;
        }
        update(view);
        view.updated_at = ts;
        true
    }

    fn blocker_entry(
        &mut self,
        entity_id: &str,
        task_id: i64,
        ts: DateTime<Utc>,
        update: impl FnOnce(&mut BlockerView),
    ) -> bool {
        let Ok(blocker_id) = entity_id.parse::<i64>() else {
            return false;
        };
        let view = self.blockers.entry(blocker_id).or_insert_with(|| BlockerView {
            task_id,
            blocker_type: None,
            status: BlockerStatus::Pending,
            question: None,
            answer: None,
            updated_at: ts,
        });
        if view.updated_at > ts {
            return false;
        }
        update(view);
        view.updated_at = ts;
        true
    }
}
