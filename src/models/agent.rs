//! Agent Models
//!
//! Agents are pool slots bound to a specialization. They are created when the
//! pool spins up a slot and retired when it shrinks.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Agent specialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Backend,
    Frontend,
    Test,
}

impl AgentType {
    pub const ALL: [AgentType; 3] = [AgentType::Backend, AgentType::Frontend, AgentType::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Backend => "backend",
            AgentType::Frontend => "frontend",
            AgentType::Test => "test",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "backend" => Some(AgentType::Backend),
            "frontend" => Some(AgentType::Frontend),
            "test" => Some(AgentType::Test),
            _ => None,
        }
    }

    /// Route a task to a specialization by keywords in its title and description.
    ///
    /// Testing keywords win over frontend keywords; anything else is backend work.
    pub fn classify(title: &str, description: &str) -> Self {
        let text = format!("{} {}", title, description);
        keyword_rules()
            .iter()
            .find(|(_, regex)| regex.is_match(&text))
            .map(|(agent_type, _)| *agent_type)
            .unwrap_or(AgentType::Backend)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword rules in precedence order (initialized once).
fn keyword_rules() -> &'static Vec<(AgentType, Regex)> {
    static RULES: OnceLock<Vec<(AgentType, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                AgentType::Test,
                r"(?i)\b(tests?|testing|coverage|unittest|pytest|jest|tdd|bdd|spec|e2e)\b",
            ),
            (
                AgentType::Frontend,
                r"(?i)\b(ui|ux|frontend|components?|css|html|page|view|layout|styles?|react|button|form|dashboard)\b",
            ),
        ]
        .into_iter()
        .filter_map(|(agent_type, pattern)| {
            Regex::new(pattern).ok().map(|regex| (agent_type, regex))
        })
        .collect()
    })
}

/// Agent status. An execution suspended on a blocker hands its agent back,
/// so agents are only ever idle or working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AgentStatus::Idle),
            "working" => Some(AgentStatus::Working),
            _ => None,
        }
    }
}

/// A pool slot bound to one specialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// `{type}-worker-{NNN}`
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task: Option<i64>,
    pub context_token_usage: u64,
    pub tasks_completed: u32,
    /// Used for last-write-wins reconciliation by observers
    pub last_update: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_type: AgentType, number: u32) -> Self {
        Self {
            id: Self::format_id(agent_type, number),
            agent_type,
            status: AgentStatus::Idle,
            current_task: None,
            context_token_usage: 0,
            tasks_completed: 0,
            last_update: Utc::now(),
        }
    }

    pub fn format_id(agent_type: AgentType, number: u32) -> String {
        format!("{}-worker-{:03}", agent_type.as_str(), number)
    }

    /// Numeric suffix of an id produced by [`Agent::format_id`].
    pub fn parse_number(id: &str) -> Option<u32> {
        id.rsplit_once("-worker-")
            .and_then(|(_, number)| number.parse().ok())
    }
}

/// Snapshot of the pool for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub max_agents: usize,
    pub total_agents: usize,
    pub idle: usize,
    pub working: usize,
    /// Executions suspended on a SYNC blocker, holding neither slot nor agent
    pub waiting: usize,
    pub agents: Vec<Agent>,
}

impl PoolStatus {
    pub fn from_agents(max_agents: usize, agents: Vec<Agent>, waiting: usize) -> Self {
        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();
        Self {
            max_agents,
            total_agents: agents.len(),
            idle: count(AgentStatus::Idle),
            working: count(AgentStatus::Working),
            waiting,
            agents,
        }
    }
}
