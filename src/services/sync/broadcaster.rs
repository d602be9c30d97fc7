//! State Sync Broadcaster
//!
//! Fans lifecycle events out to any number of observers over a tokio
//! broadcast channel. Delivery is best-effort: send failures are logged and
//! swallowed so observability never blocks core execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::models::{Agent, Blocker, BlockerFilter, Task, TaskCounts};
use crate::storage::Database;
use crate::utils::error::AppResult;

use super::events::{SyncEvent, SyncEventKind, PROJECT_ENTITY_ID};

/// Full current state handed to a (re)connecting subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncPayload {
    /// Restore generation the rows belong to
    pub epoch: u64,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub blockers: Vec<Blocker>,
    pub generated_at: DateTime<Utc>,
}

/// Message delivered to a subscriber
#[derive(Debug, Clone)]
pub enum SyncMessage {
    Event(SyncEvent),
    /// The subscriber fell behind or the state was restored; missed events
    /// are replaced by a full resync
    Resync(ResyncPayload),
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<SyncEvent>,
    db: Database,
}

impl Broadcaster {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, db }
    }

    /// Publish an event to every current subscriber
    pub fn emit(&self, event: SyncEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::debug!(
                event_type = err.0.event_type(),
                entity_id = %err.0.entity_id,
                "No subscribers for sync event"
            );
        }
    }

    pub fn task(&self, task_id: i64, kind: SyncEventKind) {
        self.emit(SyncEvent::task(task_id, kind));
    }

    /// Task event stamped with the commit time of the change it reports
    pub fn task_at(&self, task_id: i64, at: DateTime<Utc>, kind: SyncEventKind) {
        self.emit(SyncEvent::task(task_id, kind).at(at));
    }

    pub fn agent(&self, agent_id: &str, kind: SyncEventKind) {
        self.emit(SyncEvent::agent(agent_id, kind));
    }

    pub fn blocker_at(&self, blocker_id: i64, at: DateTime<Utc>, kind: SyncEventKind) {
        self.emit(SyncEvent::blocker(blocker_id, kind).at(at));
    }

    /// Publish the current agent row as `agent_updated`
    pub fn agent_updated(&self, agent: &Agent) {
        self.emit(
            SyncEvent::agent(
                &agent.id,
                SyncEventKind::AgentUpdated {
                    status: agent.status,
                    current_task: agent.current_task,
                    tasks_completed: agent.tasks_completed,
                    context_token_usage: agent.context_token_usage,
                },
            )
            .at(agent.last_update),
        );
    }

    /// Tell observers to drop their cache; subscribers turn this into a resync
    pub fn state_restored(&self, checkpoint_id: i64, epoch: u64) {
        self.emit(SyncEvent::new(
            PROJECT_ENTITY_ID,
            SyncEventKind::StateRestored {
                checkpoint_id,
                epoch,
            },
        ));
    }

    /// Publish project-wide completion counts
    pub fn project_progress(&self) {
        match self.db.list_tasks() {
            Ok(tasks) => self.emit(SyncEvent::project_progress(&TaskCounts::from_tasks(&tasks))),
            Err(e) => tracing::debug!(error = %e, "Skipping progress event"),
        }
    }

    /// Subscribe and receive the full current state.
    ///
    /// The receiver is registered before the state is read, so no event
    /// emitted after the snapshot can be missed.
    pub fn subscribe(&self) -> AppResult<Subscription> {
        let receiver = self.tx.subscribe();
        let initial = resync_payload(&self.db)?;
        Ok(Subscription {
            receiver,
            db: self.db.clone(),
            initial: Some(initial),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

fn resync_payload(db: &Database) -> AppResult<ResyncPayload> {
    Ok(ResyncPayload {
        epoch: db.state_epoch()?,
        tasks: db.list_tasks()?,
        agents: db.list_agents()?,
        blockers: db.list_blockers(&BlockerFilter::default())?,
        generated_at: Utc::now(),
    })
}

/// One observer's connection
pub struct Subscription {
    receiver: broadcast::Receiver<SyncEvent>,
    db: Database,
    initial: Option<ResyncPayload>,
}

impl Subscription {
    /// Next message; `None` once the broadcaster is gone.
    ///
    /// The first message is always the connection-time resync.
    pub async fn recv(&mut self) -> AppResult<Option<SyncMessage>> {
        if let Some(initial) = self.initial.take() {
            return Ok(Some(SyncMessage::Resync(initial)));
        }
        match self.receiver.recv().await {
            Ok(event) => self.deliver(event).map(Some),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Subscriber lagged, sending full resync");
                Ok(Some(SyncMessage::Resync(resync_payload(&self.db)?)))
            }
            Err(RecvError::Closed) => Ok(None),
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]
    pub fn try_recv(&mut self) -> AppResult<Option<SyncMessage>> {
        if let Some(initial) = self.initial.take() {
            return Ok(Some(SyncMessage::Resync(initial)));
        }
        match self.receiver.try_recv() {
            Ok(event) => self.deliver(event).map(Some),
            Err(TryRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Subscriber lagged, sending full resync");
                Ok(Some(SyncMessage::Resync(resync_payload(&self.db)?)))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => Ok(None),
        }
    }

    fn deliver(&self, event: SyncEvent) -> AppResult<SyncMessage> {
        if let SyncEventKind::StateRestored { epoch, .. } = event.kind {
            tracing::debug!(epoch, "State restored, sending full resync");
            return Ok(SyncMessage::Resync(resync_payload(&self.db)?));
        }
        Ok(SyncMessage::Event(event))
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> AppResult<Vec<SyncMessage>> {
        let mut messages = Vec::new();
        while let Some(message) = self.try_recv()? {
            messages.push(message);
        }
        Ok(messages)
    }
}
