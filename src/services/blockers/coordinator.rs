//! Blocker Coordinator
//!
//! Owns the PENDING → RESOLVED | EXPIRED state machine. SYNC blockers pause
//! their task chain through the scheduler; ASYNC blockers are recorded only.
//! Waiting workers suspend on a per-blocker watch channel that resolution and
//! expiry signal, with a periodic store re-check so answers written by another
//! process are still noticed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::models::{
    Blocker, BlockerFilter, BlockerMetrics, BlockerStatus, BlockerType, NewBlocker,
    OrchestratorConfig, SyncExpiryPolicy, TaskStatus,
};
use crate::services::scheduler::Scheduler;
use crate::services::sync::{Broadcaster, SyncEventKind};
use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

/// Ten years; longer TTLs are clamped
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone)]
pub struct BlockerSettings {
    pub ttl: Duration,
    pub sweep_interval: StdDuration,
    pub max_question_length: usize,
    pub max_answer_length: usize,
    pub sync_expiry_policy: SyncExpiryPolicy,
}

impl BlockerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            ttl: Duration::seconds(config.blocker_ttl_secs.min(MAX_TTL_SECS) as i64),
            sweep_interval: StdDuration::from_secs(config.blocker_sweep_interval_secs.max(1)),
            max_question_length: config.max_question_length,
            max_answer_length: config.max_answer_length,
            sync_expiry_policy: config.sync_expiry_policy,
        }
    }
}

impl Default for BlockerSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

pub struct BlockerCoordinator {
    db: Database,
    scheduler: Arc<Scheduler>,
    broadcaster: Broadcaster,
    settings: BlockerSettings,
    /// Wake-up channels of suspended waiters, keyed by blocker id
    waiters: DashMap<i64, watch::Sender<()>>,
    /// Signalled whenever a blocker leaves PENDING, so the pool re-plans
    wakeup: Arc<Notify>,
}

impl BlockerCoordinator {
    pub fn new(
        db: Database,
        scheduler: Arc<Scheduler>,
        broadcaster: Broadcaster,
        settings: BlockerSettings,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            scheduler,
            broadcaster,
            settings,
            waiters: DashMap::new(),
            wakeup,
        }
    }

    pub fn settings(&self) -> &BlockerSettings {
        &self.settings
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Record a question raised by `agent_id` while working on `task_id`.
    ///
    /// A SYNC blocker immediately pauses the task and its transitive dependents.
    pub fn create_blocker(
        &self,
        agent_id: &str,
        task_id: i64,
        question: &str,
        blocker_type: BlockerType,
    ) -> AppResult<Blocker> {
        let question = self.validate_question(question)?;
        let task = self.scheduler.get_task(task_id)?;
        if task.status.is_terminal() {
            return Err(AppError::conflict(format!(
                "Task {} is already {}",
                task_id, task.status
            )));
        }

        let blocker = self.insert(agent_id, task_id, question, blocker_type)?;
        if blocker_type == BlockerType::Sync {
            self.scheduler.block_chain(task_id)?;
        }
        Ok(blocker)
    }

    /// Convert an exhausted task into a question for a human.
    ///
    /// Records one ASYNC blocker and parks the task as blocked, detached from
    /// its agent. Answering the blocker sends the task back for a fresh run.
    pub fn escalate_task(&self, agent_id: &str, task_id: i64, question: &str) -> AppResult<Blocker> {
        let question = self.validate_question(question)?;
        let blocker = self.insert(agent_id, task_id, question, BlockerType::Async)?;
        self.scheduler.park_task(task_id)?;
        Ok(blocker)
    }

    fn insert(
        &self,
        agent_id: &str,
        task_id: i64,
        question: String,
        blocker_type: BlockerType,
    ) -> AppResult<Blocker> {
        let now = Utc::now();
        let blocker = self.db.insert_blocker(&NewBlocker {
            agent_id: agent_id.to_string(),
            task_id,
            blocker_type,
            question,
            created_at: now,
            expires_at: now + self.settings.ttl,
        })?;

        tracing::info!(
            blocker_id = blocker.id,
            task_id,
            agent_id,
            blocker_type = %blocker_type,
            "Blocker created"
        );
        self.broadcaster.blocker_at(
            blocker.id,
            blocker.created_at,
            SyncEventKind::BlockerCreated {
                task_id,
                blocker_type,
                question: blocker.question.clone(),
            },
        );
        Ok(blocker)
    }

    fn validate_question(&self, question: &str) -> AppResult<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::validation("Blocker question cannot be empty"));
        }
        if question.chars().count() > self.settings.max_question_length {
            return Err(AppError::validation(format!(
                "Blocker question exceeds {} characters",
                self.settings.max_question_length
            )));
        }
        Ok(question.to_string())
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Answer a pending blocker and resume whatever it paused.
    pub fn resolve(&self, blocker_id: i64, answer: &str) -> AppResult<Blocker> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(AppError::validation("Answer cannot be empty"));
        }
        if answer.chars().count() > self.settings.max_answer_length {
            return Err(AppError::validation(format!(
                "Answer exceeds {} characters",
                self.settings.max_answer_length
            )));
        }

        let blocker = self.get(blocker_id)?;
        let resolved_at = Utc::now();
        if !self.db.resolve_blocker(blocker_id, answer, resolved_at)? {
            return Err(AppError::conflict(format!(
                "Blocker {} is no longer pending",
                blocker_id
            )));
        }

        if self.has_pending_for_task(blocker.task_id, blocker.blocker_type)? {
            tracing::debug!(blocker_id, task_id = blocker.task_id, "Task still has pending blockers");
        } else {
            match blocker.blocker_type {
                BlockerType::Sync => {
                    self.scheduler.release_chain(blocker.task_id)?;
                }
                BlockerType::Async => {
                    if self.is_parked(blocker.task_id)? {
                        self.scheduler.release_chain(blocker.task_id)?;
                    }
                }
            }
        }

        tracing::info!(blocker_id, task_id = blocker.task_id, "Blocker resolved");
        self.broadcaster.blocker_at(
            blocker_id,
            resolved_at,
            SyncEventKind::BlockerResolved {
                task_id: blocker.task_id,
                answer: answer.to_string(),
            },
        );
        self.signal(blocker_id);
        self.get(blocker_id)
    }

    /// Expire a pending blocker and apply its effect on the task.
    ///
    /// Returns false when the blocker had already left PENDING.
    pub fn expire(&self, blocker_id: i64) -> AppResult<bool> {
        let blocker = self.get(blocker_id)?;
        let expired_at = Utc::now();
        if !self.db.expire_blocker(blocker_id, expired_at)? {
            return Ok(false);
        }
        let reason = format!("blocker {} expired", blocker_id);

        match blocker.blocker_type {
            BlockerType::Sync => match self.settings.sync_expiry_policy {
                SyncExpiryPolicy::Escalate => {
                    if self.has_pending_for_task(blocker.task_id, BlockerType::Sync)? {
                        // Another open SYNC question still holds the chain
                        self.scheduler.park_task(blocker.task_id)?;
                    } else {
                        self.scheduler.escalate_chain(blocker.task_id)?;
                    }
                    self.insert(
                        &blocker.agent_id,
                        blocker.task_id,
                        blocker.question.clone(),
                        BlockerType::Async,
                    )?;
                }
                SyncExpiryPolicy::FailChain => {
                    self.scheduler.fail_chain(blocker.task_id, &reason)?;
                }
            },
            BlockerType::Async => {
                if self.is_parked(blocker.task_id)?
                    && !self.has_pending_for_task(blocker.task_id, BlockerType::Async)?
                {
                    self.scheduler.fail_task(blocker.task_id, &reason)?;
                }
            }
        }

        tracing::warn!(
            blocker_id,
            task_id = blocker.task_id,
            blocker_type = %blocker.blocker_type,
            policy = self.settings.sync_expiry_policy.as_str(),
            "Blocker expired"
        );
        self.broadcaster.blocker_at(
            blocker_id,
            expired_at,
            SyncEventKind::BlockerExpired {
                task_id: blocker.task_id,
            },
        );
        self.signal(blocker_id);
        Ok(true)
    }

    /// Expire every pending blocker past its deadline
    pub fn expire_stale(&self) -> AppResult<Vec<i64>> {
        let mut expired = Vec::new();
        for blocker in self.db.due_blockers(Utc::now())? {
            if self.expire(blocker.id)? {
                expired.push(blocker.id);
            }
        }
        Ok(expired)
    }

    /// Close a cancelled task's pending blockers without applying expiry policy
    pub fn withdraw_for_task(&self, task_id: i64) -> AppResult<Vec<i64>> {
        let mut withdrawn = Vec::new();
        for blocker in self.db.list_blockers(&BlockerFilter {
            status: Some(BlockerStatus::Pending),
            task_id: Some(task_id),
            ..Default::default()
        })? {
            let expired_at = Utc::now();
            if self.db.expire_blocker(blocker.id, expired_at)? {
                self.broadcaster.blocker_at(
                    blocker.id,
                    expired_at,
                    SyncEventKind::BlockerExpired { task_id },
                );
                self.signal(blocker.id);
                withdrawn.push(blocker.id);
            }
        }
        Ok(withdrawn)
    }

    fn has_pending_for_task(&self, task_id: i64, blocker_type: BlockerType) -> AppResult<bool> {
        Ok(!self
            .db
            .list_blockers(&BlockerFilter {
                status: Some(BlockerStatus::Pending),
                blocker_type: Some(blocker_type),
                task_id: Some(task_id),
            })?
            .is_empty())
    }

    /// Blocked behind itself with no worker attached
    fn is_parked(&self, task_id: i64) -> AppResult<bool> {
        let task = self.scheduler.get_task(task_id)?;
        Ok(task.status == TaskStatus::Blocked
            && task.blocked_by.contains(&task_id)
            && task.assigned_agent.is_none())
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    fn signal(&self, blocker_id: i64) {
        if let Some(tx) = self.waiters.get(&blocker_id) {
            tx.send_replace(());
        }
        self.wakeup.notify_one();
    }

    /// Suspend until the blocker is resolved, expires, or `cancel` fires.
    ///
    /// Returns the answer. Reaching the blocker's deadline expires it and
    /// yields `BlockerExpired`.
    pub async fn wait_for_resolution(
        &self,
        blocker_id: i64,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        let mut rx = self
            .waiters
            .entry(blocker_id)
            .or_insert_with(|| watch::channel(()).0)
            .subscribe();

        let outcome = self.wait_loop(blocker_id, &mut rx, cancel).await;

        drop(rx);
        self.waiters
            .remove_if(&blocker_id, |_, tx| tx.receiver_count() == 0);
        outcome
    }

    async fn wait_loop(
        &self,
        blocker_id: i64,
        rx: &mut watch::Receiver<()>,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        loop {
            let blocker = self.get(blocker_id)?;
            match blocker.status {
                BlockerStatus::Resolved => return Ok(blocker.answer.unwrap_or_default()),
                BlockerStatus::Expired => return Err(AppError::BlockerExpired { blocker_id }),
                BlockerStatus::Pending => {}
            }

            let now = Utc::now();
            if now >= blocker.expires_at {
                self.expire(blocker_id)?;
                continue;
            }
            let until_expiry = (blocker.expires_at - now)
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            let nap = until_expiry.min(self.settings.sweep_interval);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!(
                        "wait on blocker {} cancelled",
                        blocker_id
                    )));
                }
                _ = rx.changed() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, blocker_id: i64) -> AppResult<Blocker> {
        self.db
            .get_blocker(blocker_id)?
            .ok_or_else(|| AppError::not_found(format!("Blocker {} not found", blocker_id)))
    }

    pub fn list(&self, filter: &BlockerFilter) -> AppResult<Vec<Blocker>> {
        self.db.list_blockers(filter)
    }

    pub fn for_task(&self, task_id: i64) -> AppResult<Vec<Blocker>> {
        self.db.list_blockers(&BlockerFilter {
            task_id: Some(task_id),
            ..Default::default()
        })
    }

    pub fn count_by_status(&self) -> AppResult<HashMap<BlockerStatus, usize>> {
        let mut counts = HashMap::new();
        for blocker in self.db.list_blockers(&BlockerFilter::default())? {
            *counts.entry(blocker.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn metrics(&self) -> AppResult<BlockerMetrics> {
        Ok(BlockerMetrics::from_blockers(
            &self.db.list_blockers(&BlockerFilter::default())?,
        ))
    }
}
