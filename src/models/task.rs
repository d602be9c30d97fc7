//! Task Models
//!
//! Tasks are nodes of the dependency graph. They are created at plan time and
//! never deleted, only transitioned.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentType;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed, failed and cancelled tasks never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `assigned_agent` of a task whose execution is suspended on a SYNC blocker
/// and holds no agent until it resumes
pub const WAITING_FOR_AGENT: &str = "waiting";

/// A unit of development work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Ids of tasks that must complete before this one may start
    pub dependencies: BTreeSet<i64>,
    /// Lower is more urgent
    pub priority: i32,
    /// Lower is an earlier phase
    pub workflow_step: i32,
    /// Specialization that executes the task
    pub agent_type: AgentType,
    /// Agent running the task, or [`WAITING_FOR_AGENT`] while its execution
    /// waits on a question
    pub assigned_agent: Option<String>,
    /// Tasks whose pending pause holds this one; non-empty iff status is blocked
    pub blocked_by: BTreeSet<i64>,
    /// 0..=100
    pub progress: u8,
    pub explanation: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task from a plan entry.
    pub fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> Self {
        let agent_type = spec
            .agent_type
            .unwrap_or_else(|| AgentType::classify(&spec.title, &spec.description));
        Self {
            id: spec.id,
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies.into_iter().collect(),
            priority: spec.priority,
            workflow_step: spec.workflow_step,
            agent_type,
            assigned_agent: None,
            blocked_by: BTreeSet::new(),
            progress: 0,
            explanation: None,
            error: None,
            modified_files: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Assignment ordering key: priority, then workflow step, then id.
    pub fn order_key(&self) -> (i32, i32, i64) {
        (self.priority, self.workflow_step, self.id)
    }
}

/// A task entry as written in a plan file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub workflow_step: i32,
    #[serde(default)]
    pub agent_type: Option<AgentType>,
}

impl TaskSpec {
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            dependencies: Vec::new(),
            priority: 0,
            workflow_step: 0,
            agent_type: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = i64>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_workflow_step(mut self, step: i32) -> Self {
        self.workflow_step = step;
        self
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }
}

/// A plan file: `{"tasks": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub tasks: Vec<TaskSpec>,
}

/// Outcome of one pass of the worker pipeline over a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: i64,
    pub status: TaskStatus,
    pub modified_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskExecutionResult {
    pub fn completed(task_id: i64, modified_files: Vec<String>, explanation: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            modified_files,
            explanation: Some(explanation),
            error: None,
        }
    }

    pub fn stopped(task_id: i64, status: TaskStatus, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            modified_files: Vec::new(),
            explanation: None,
            error: Some(error.into()),
        }
    }
}

/// Project-wide task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub blocked: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl TaskCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.completed) / f64::from(self.total) * 100.0
    }
}
