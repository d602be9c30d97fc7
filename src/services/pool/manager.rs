//! Agent Pool
//!
//! The single coordinating loop. It takes ready tasks in assignment order,
//! binds each to an agent under a semaphore sized to the concurrency ceiling,
//! claims it with a compare-and-set, and runs the specialist pipeline as an
//! independent tokio task. A worker failure or panic only fails its own task.
//!
//! A run holds the project's run lease for its whole duration, so a second
//! process opening the same project can observe and answer blockers but
//! never claims or recovers tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::models::{PoolStatus, Task, TaskExecutionResult, TaskStatus};
use crate::services::worker::{specialist_for, WorkerServices};
use crate::storage::Database;
use crate::utils::error::AppResult;

use super::lease::{RunLease, RUN_LEASE_HEARTBEAT};
use super::registry::AgentRegistry;
use super::slot::WorkerSlot;

/// What one `run` did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub blocked: usize,
    /// Executions stopped by shutdown and returned to the queue
    pub interrupted: usize,
}

impl RunSummary {
    fn record(&mut self, result: &TaskExecutionResult) {
        match result.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::Pending | TaskStatus::InProgress => self.interrupted += 1,
        }
    }
}

pub struct AgentPool {
    db: Database,
    services: WorkerServices,
    registry: Arc<AgentRegistry>,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    wakeup: Arc<Notify>,
    running: Arc<DashMap<i64, CancellationToken>>,
    sweep_interval: Duration,
}

impl AgentPool {
    /// `services.shutdown` stops the pool; `wakeup` is notified by anything
    /// that may have made tasks ready (blocker resolution, a new plan).
    pub fn new(
        db: Database,
        services: WorkerServices,
        registry: Arc<AgentRegistry>,
        wakeup: Arc<Notify>,
        sweep_interval: Duration,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(registry.max_agents()));
        Self {
            db,
            services,
            registry,
            semaphore,
            waiting: Arc::new(AtomicUsize::new(0)),
            wakeup,
            running: Arc::new(DashMap::new()),
            sweep_interval: sweep_interval.max(Duration::from_millis(10)),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Stop taking tasks and interrupt running executions
    pub fn shutdown(&self) {
        self.services.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.services.shutdown.is_cancelled()
    }

    /// Executions currently suspended on a SYNC blocker
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn agent_status(&self) -> AppResult<PoolStatus> {
        self.registry.status(self.waiting())
    }

    /// Cancel a pending or running task.
    ///
    /// The task becomes `cancelled`, its pending blockers are withdrawn, and
    /// a running execution is interrupted at its next suspension point.
    pub fn cancel_task(&self, task_id: i64) -> AppResult<Option<Task>> {
        let cancelled = self.services.scheduler.cancel_task(task_id)?;
        if let Some(token) = self.running.get(&task_id) {
            token.cancel();
        }
        self.services.blockers.withdraw_for_task(task_id)?;
        self.wakeup.notify_one();
        Ok(cancelled)
    }

    /// Schedule until nothing is ready and nothing is running, or shutdown.
    ///
    /// Fails with a conflict when another run holds the project lease. Once
    /// the lease is held, tasks and agents an interrupted run left behind are
    /// returned to the queue.
    ///
    /// Ready tasks are taken in waves: the ready set is re-read only once the
    /// previous wave has been handed out, so tasks that became ready later
    /// queue behind it.
    pub async fn run(&self) -> AppResult<RunSummary> {
        let lease = RunLease::acquire(&self.db, "run")?;
        let requeued = self.services.scheduler.recover_interrupted()?;
        if !requeued.is_empty() {
            tracing::info!(tasks = ?requeued, "Requeued tasks interrupted by a previous run");
        }
        self.registry.recover()?;

        let mut summary = RunSummary::default();
        let mut workers: JoinSet<TaskExecutionResult> = JoinSet::new();
        let mut wave: VecDeque<Task> = VecDeque::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(RUN_LEASE_HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = self.services.shutdown.clone();

        tracing::info!(
            max_agents = self.registry.max_agents(),
            lease = lease.holder(),
            "Agent pool started"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if wave.is_empty() {
                wave.extend(self.services.scheduler.ready_tasks()?);
            }
            while !wave.is_empty() {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(task) = wave.pop_front() else {
                    break;
                };
                match self.start(task, permit, &mut workers) {
                    Ok(true) => summary.started += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to start task"),
                }
            }

            // Tasks that are ready but failed to start wait for the next wakeup or sweep
            if workers.is_empty()
                && wave.is_empty()
                && self.services.scheduler.ready_tasks()?.is_empty()
            {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(result) => summary.record(&result),
                        Err(e) => tracing::error!(error = %e, "Worker supervisor failed"),
                    }
                }
                _ = self.wakeup.notified() => {}
                _ = heartbeat.tick() => {
                    if let Err(e) = lease.renew() {
                        tracing::error!(error = %e, "Lost the run lease, stopping");
                        shutdown.cancel();
                    }
                }
                _ = sweep.tick() => {
                    match self.services.blockers.expire_stale() {
                        Ok(expired) if !expired.is_empty() => {
                            tracing::info!(expired = ?expired, "Expired stale blockers");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Blocker sweep failed"),
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => summary.record(&result),
                Err(e) => tracing::error!(error = %e, "Worker supervisor failed"),
            }
        }
        tracing::info!(
            started = summary.started,
            completed = summary.completed,
            failed = summary.failed,
            blocked = summary.blocked,
            "Agent pool stopped"
        );
        Ok(summary)
    }

    /// Bind an agent, claim the task and spawn its execution.
    ///
    /// Returns false when the claim was lost.
    fn start(
        &self,
        task: Task,
        permit: OwnedSemaphorePermit,
        workers: &mut JoinSet<TaskExecutionResult>,
    ) -> AppResult<bool> {
        let scheduler = Arc::clone(&self.services.scheduler);
        let agent = self.registry.acquire(task.agent_type, task.id)?;
        if !scheduler.claim(task.id, &agent.id)? {
            self.registry.release(&agent.id, false)?;
            return Ok(false);
        }
        let task = scheduler.get_task(task.id)?;
        let task_id = task.id;

        let cancel = self.services.shutdown.child_token();
        self.running.insert(task_id, cancel.clone());
        let slot = WorkerSlot::new(
            Arc::clone(&self.semaphore),
            Arc::clone(&self.registry),
            Arc::clone(&self.waiting),
            Arc::clone(&self.wakeup),
            permit,
            &agent,
            task_id,
        );
        let services = self.services.clone();
        let running = Arc::clone(&self.running);

        workers.spawn(async move {
            let execution = tokio::spawn(async move {
                let mut slot = slot;
                let specialist = specialist_for(task.agent_type);
                let result = specialist
                    .execute_task(&services, task, &mut slot, &cancel)
                    .await;
                if let Err(e) = slot.finish(result.status == TaskStatus::Completed) {
                    tracing::warn!(task_id, error = %e, "Failed to release worker slot");
                }
                result
            });

            let result = match execution.await {
                Ok(result) => result,
                Err(e) => {
                    let error = format!("worker panicked: {}", e);
                    tracing::error!(task_id, error = %error, "Worker crashed");
                    if let Err(e) = scheduler.fail_task(task_id, &error) {
                        tracing::error!(task_id, error = %e, "Failed to mark crashed task failed");
                    }
                    TaskExecutionResult::stopped(task_id, TaskStatus::Failed, error)
                }
            };
            running.remove(&task_id);
            result
        });
        Ok(true)
    }
}
