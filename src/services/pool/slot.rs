//! Worker Slot
//!
//! One execution's hold on the pool: a semaphore permit plus the agent bound
//! to it. A worker that waits on a SYNC blocker detaches both so the pool
//! keeps scheduling, and reattaches (possibly to a different agent) once the
//! blocker is answered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::models::{Agent, AgentType};
use crate::services::context::SharedContextStore;
use crate::utils::error::{AppError, AppResult};

use super::registry::AgentRegistry;

pub struct WorkerSlot {
    semaphore: Arc<Semaphore>,
    registry: Arc<AgentRegistry>,
    waiting: Arc<AtomicUsize>,
    wakeup: Arc<Notify>,
    permit: Option<OwnedSemaphorePermit>,
    agent_type: AgentType,
    agent_id: String,
    task_id: i64,
    finished: bool,
}

impl WorkerSlot {
    pub(crate) fn new(
        semaphore: Arc<Semaphore>,
        registry: Arc<AgentRegistry>,
        waiting: Arc<AtomicUsize>,
        wakeup: Arc<Notify>,
        permit: OwnedSemaphorePermit,
        agent: &Agent,
        task_id: i64,
    ) -> Self {
        Self {
            semaphore,
            registry,
            waiting,
            wakeup,
            permit: Some(permit),
            agent_type: agent.agent_type,
            agent_id: agent.id.clone(),
            task_id,
            finished: false,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn is_attached(&self) -> bool {
        self.permit.is_some()
    }

    /// Context store of the agent currently bound to this slot
    pub fn context(&self) -> AppResult<SharedContextStore> {
        self.registry.context_store(&self.agent_id)
    }

    /// Give the permit and agent back while the execution waits
    pub fn detach(&mut self) -> AppResult<()> {
        if self.permit.is_none() {
            return Ok(());
        }
        self.registry.release(&self.agent_id, false)?;
        self.permit = None;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        // The freed permit may let the pool start another task
        self.wakeup.notify_one();
        tracing::debug!(task_id = self.task_id, agent_id = %self.agent_id, "Worker detached");
        Ok(())
    }

    /// Take a permit and an agent again after a wait
    pub async fn reattach(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        if self.permit.is_some() {
            return Ok(());
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!(
                    "task {} cancelled while waiting for a slot",
                    self.task_id
                )));
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| AppError::internal("agent pool closed"))?
            }
        };
        let agent = self.registry.acquire(self.agent_type, self.task_id)?;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.permit = Some(permit);
        self.agent_id = agent.id;
        tracing::debug!(task_id = self.task_id, agent_id = %self.agent_id, "Worker reattached");
        Ok(())
    }

    /// Release the slot at the end of an execution
    pub fn finish(mut self, completed: bool) -> AppResult<()> {
        self.finished = true;
        if self.permit.take().is_some() {
            self.registry.release(&self.agent_id, completed)?;
        } else {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.permit.take().is_some() {
            if let Err(e) = self.registry.release(&self.agent_id, false) {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to release agent");
            }
        } else {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
