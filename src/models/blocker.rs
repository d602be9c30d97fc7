//! Blocker Models
//!
//! Questions raised by workers that need a human decision.
//! PENDING → RESOLVED | EXPIRED, immutable once terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SYNC blockers pause the task and its dependents; ASYNC blockers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockerType {
    Sync,
    Async,
}

impl BlockerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerType::Sync => "SYNC",
            BlockerType::Async => "ASYNC",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC" => Some(BlockerType::Sync),
            "ASYNC" => Some(BlockerType::Async),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockerStatus {
    Pending,
    Resolved,
    Expired,
}

impl BlockerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerStatus::Pending => "PENDING",
            BlockerStatus::Resolved => "RESOLVED",
            BlockerStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(BlockerStatus::Pending),
            "RESOLVED" => Some(BlockerStatus::Resolved),
            "EXPIRED" => Some(BlockerStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BlockerStatus::Pending)
    }
}

impl std::fmt::Display for BlockerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A question raised by a worker mid-execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: i64,
    pub agent_id: String,
    pub task_id: i64,
    #[serde(rename = "type")]
    pub blocker_type: BlockerType,
    pub question: String,
    pub answer: Option<String>,
    pub status: BlockerStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Blocker {
    /// Timestamp of the latest transition, used for reconciliation.
    pub fn last_changed(&self) -> DateTime<Utc> {
        self.resolved_at.unwrap_or(self.created_at)
    }

    pub fn is_pending(&self) -> bool {
        self.status == BlockerStatus::Pending
    }
}

/// Fields supplied when a blocker is created
#[derive(Debug, Clone)]
pub struct NewBlocker {
    pub agent_id: String,
    pub task_id: i64,
    pub blocker_type: BlockerType,
    pub question: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Filter for listing blockers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockerFilter {
    pub status: Option<BlockerStatus>,
    pub blocker_type: Option<BlockerType>,
    pub task_id: Option<i64>,
}

impl BlockerFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(BlockerStatus::Pending),
            ..Default::default()
        }
    }
}

/// Aggregate blocker statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockerMetrics {
    pub total: u32,
    pub pending: u32,
    pub resolved: u32,
    pub expired: u32,
    pub sync_count: u32,
    pub async_count: u32,
    /// Mean seconds from creation to resolution over resolved blockers
    pub average_resolution_secs: Option<f64>,
    /// Expired blockers as a percentage of all blockers
    pub expiration_rate_percent: f64,
}

impl BlockerMetrics {
    pub fn from_blockers(blockers: &[Blocker]) -> Self {
        let mut metrics = Self {
            total: blockers.len() as u32,
            ..Default::default()
        };
        let mut resolution_total = 0.0;
        for blocker in blockers {
            match blocker.status {
                BlockerStatus::Pending => metrics.pending += 1,
                BlockerStatus::Resolved => metrics.resolved += 1,
                BlockerStatus::Expired => metrics.expired += 1,
            }
            match blocker.blocker_type {
                BlockerType::Sync => metrics.sync_count += 1,
                BlockerType::Async => metrics.async_count += 1,
            }
            if let (BlockerStatus::Resolved, Some(resolved_at)) =
                (blocker.status, blocker.resolved_at)
            {
                resolution_total +=
                    (resolved_at - blocker.created_at).num_milliseconds() as f64 / 1000.0;
            }
        }
        if metrics.resolved > 0 {
            metrics.average_resolution_secs = Some(resolution_total / f64::from(metrics.resolved));
        }
        if metrics.total > 0 {
            metrics.expiration_rate_percent =
                f64::from(metrics.expired) / f64::from(metrics.total) * 100.0;
        }
        metrics
    }
}
