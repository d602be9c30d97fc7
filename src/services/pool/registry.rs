//! Agent Registry
//!
//! Agents are `{type}-worker-{NNN}` slots bound to one specialization. The
//! registry hands idle agents to executions, creates new ones up to the
//! ceiling, and retires idle agents of another type to make room. Each agent
//! owns one context tier store, opened lazily and kept for its lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;

use crate::models::{Agent, AgentStatus, AgentType, PoolStatus};
use crate::services::context::{ContextTierStore, SharedContextStore, TierBudgets};
use crate::services::sync::{Broadcaster, SyncEventKind};
use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

fn load_agents(db: &Database) -> AppResult<HashMap<String, Agent>> {
    Ok(db
        .list_agents()?
        .into_iter()
        .map(|agent| (agent.id.clone(), agent))
        .collect())
}

/// Agents persisted as busy; whoever marked them may still be running
fn busy_ids(agents: &HashMap<String, Agent>) -> HashSet<String> {
    agents
        .values()
        .filter(|a| a.status != AgentStatus::Idle || a.current_task.is_some())
        .map(|a| a.id.clone())
        .collect()
}

pub struct AgentRegistry {
    db: Database,
    broadcaster: Broadcaster,
    max_agents: usize,
    budgets: TierBudgets,
    agents: Mutex<HashMap<String, Agent>>,
    /// Agents found busy at load time, not acquired by this process
    inherited: Mutex<HashSet<String>>,
    contexts: DashMap<String, SharedContextStore>,
}

impl AgentRegistry {
    /// Load persisted agents as they are.
    ///
    /// Agents another process left `working` stay that way until the process
    /// owning the run calls [`AgentRegistry::recover`].
    pub fn load(
        db: Database,
        broadcaster: Broadcaster,
        max_agents: usize,
        budgets: TierBudgets,
    ) -> AppResult<Self> {
        let agents = load_agents(&db)?;
        let inherited = busy_ids(&agents);
        Ok(Self {
            db,
            broadcaster,
            max_agents: max_agents.max(1),
            budgets,
            inherited: Mutex::new(inherited),
            agents: Mutex::new(agents),
            contexts: DashMap::new(),
        })
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, Agent>>> {
        self.agents
            .lock()
            .map_err(|_| AppError::internal("agent registry lock poisoned"))
    }

    fn lock_inherited(&self) -> AppResult<std::sync::MutexGuard<'_, HashSet<String>>> {
        self.inherited
            .lock()
            .map_err(|_| AppError::internal("agent registry lock poisoned"))
    }

    /// Bind an agent of `agent_type` to `task_id`.
    ///
    /// Prefers the lowest-numbered idle agent of the type, then a new agent
    /// while under the ceiling, then retires an idle agent of another type.
    pub fn acquire(&self, agent_type: AgentType, task_id: i64) -> AppResult<Agent> {
        let mut agents = self.lock()?;

        let reusable = agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.status == AgentStatus::Idle)
            .min_by_key(|a| Agent::parse_number(&a.id).unwrap_or(u32::MAX))
            .map(|a| a.id.clone());

        let agent_id = match reusable {
            Some(id) => id,
            None => {
                if agents.len() >= self.max_agents {
                    let victim = agents
                        .values()
                        .filter(|a| a.status == AgentStatus::Idle)
                        .min_by_key(|a| a.last_update)
                        .map(|a| a.id.clone())
                        .ok_or_else(|| {
                            AppError::conflict(format!(
                                "All {} agents are working",
                                self.max_agents
                            ))
                        })?;
                    agents.remove(&victim);
                    self.forget(&victim)?;
                }
                let number = agents
                    .values()
                    .filter(|a| a.agent_type == agent_type)
                    .filter_map(|a| Agent::parse_number(&a.id))
                    .max()
                    .unwrap_or(0)
                    + 1;
                let agent = Agent::new(agent_type, number);
                tracing::info!(agent_id = %agent.id, agent_type = agent_type.as_str(), "Agent created");
                self.broadcaster
                    .agent(&agent.id, SyncEventKind::AgentCreated { agent_type });
                let id = agent.id.clone();
                agents.insert(id.clone(), agent);
                id
            }
        };

        let agent = agents
            .get_mut(&agent_id)
            .ok_or_else(|| AppError::internal(format!("agent {} vanished", agent_id)))?;
        agent.status = AgentStatus::Working;
        agent.current_task = Some(task_id);
        agent.last_update = Utc::now();
        self.db.upsert_agent(agent)?;
        self.broadcaster.agent_updated(agent);
        Ok(agent.clone())
    }

    /// Return an agent to idle after its execution ended or suspended
    pub fn release(&self, agent_id: &str, completed: bool) -> AppResult<()> {
        let usage = self.context_usage(agent_id);
        let mut agents = self.lock()?;
        let Some(agent) = agents.get_mut(agent_id) else {
            return Ok(());
        };
        agent.status = AgentStatus::Idle;
        agent.current_task = None;
        if completed {
            agent.tasks_completed += 1;
        }
        if let Some(usage) = usage {
            agent.context_token_usage = usage;
        }
        agent.last_update = Utc::now();
        self.db.upsert_agent(agent)?;
        self.broadcaster.agent_updated(agent);
        Ok(())
    }

    /// Remove an idle agent and its context
    pub fn retire_agent(&self, agent_id: &str) -> AppResult<bool> {
        let mut agents = self.lock()?;
        match agents.get(agent_id) {
            None => Ok(false),
            Some(agent) if agent.status == AgentStatus::Working => Err(AppError::conflict(
                format!("Agent {} is working on task {:?}", agent_id, agent.current_task),
            )),
            Some(_) => {
                agents.remove(agent_id);
                self.forget(agent_id)?;
                Ok(true)
            }
        }
    }

    fn forget(&self, agent_id: &str) -> AppResult<()> {
        self.contexts.remove(agent_id);
        self.db.delete_agent(agent_id)?;
        tracing::info!(agent_id, "Agent retired");
        self.broadcaster.agent(agent_id, SyncEventKind::AgentRetired);
        Ok(())
    }

    /// Replace the in-memory agents with the persisted ones and drop every
    /// cached context store. Refused while any agent is working.
    pub fn reload(&self) -> AppResult<()> {
        let mut agents = self.lock()?;
        if agents.values().any(|a| a.status == AgentStatus::Working) {
            return Err(AppError::conflict("cannot reload agents while any is working"));
        }
        *agents = load_agents(&self.db)?;
        *self.lock_inherited()? = busy_ids(&agents);
        self.contexts.clear();
        Ok(())
    }

    /// Reset agents an interrupted run left `working` back to idle.
    ///
    /// Only agents found busy at load time are touched; agents acquired by
    /// this process stay as they are. Only the holder of the run lease may
    /// call this. Returns the reset ids.
    pub fn recover(&self) -> AppResult<Vec<String>> {
        let mut agents = self.lock()?;
        let inherited = std::mem::take(&mut *self.lock_inherited()?);
        let mut recovered = Vec::new();
        for agent_id in inherited {
            let Some(agent) = agents.get_mut(&agent_id) else {
                continue;
            };
            agent.status = AgentStatus::Idle;
            agent.current_task = None;
            agent.last_update = Utc::now();
            self.db.upsert_agent(agent)?;
            self.broadcaster.agent_updated(agent);
            recovered.push(agent.id.clone());
        }
        recovered.sort();
        if !recovered.is_empty() {
            tracing::warn!(agents = ?recovered, "Recovered interrupted agents");
        }
        Ok(recovered)
    }

    /// The agent's context store, opened from the persisted items on first use
    pub fn context_store(&self, agent_id: &str) -> AppResult<SharedContextStore> {
        if let Some(store) = self.contexts.get(agent_id) {
            return Ok(store.clone());
        }
        let store = ContextTierStore::open(self.db.clone(), agent_id, self.budgets)?.shared();
        Ok(self
            .contexts
            .entry(agent_id.to_string())
            .or_insert(store)
            .clone())
    }

    fn context_usage(&self, agent_id: &str) -> Option<u64> {
        let store = self.contexts.get(agent_id)?;
        let guard = store.lock().ok()?;
        Some(guard.hot_tokens())
    }

    pub fn agents(&self) -> AppResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.lock()?.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    pub fn working_count(&self) -> AppResult<usize> {
        Ok(self
            .lock()?
            .values()
            .filter(|a| a.status == AgentStatus::Working)
            .count())
    }

    pub fn status(&self, waiting: usize) -> AppResult<PoolStatus> {
        Ok(PoolStatus::from_agents(self.max_agents, self.agents()?, waiting))
    }
}
