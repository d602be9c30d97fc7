//! Settings Models
//!
//! Orchestrator configuration stored in `.conductor/config.json`.

use serde::{Deserialize, Serialize};

/// What happens to a task whose SYNC blocker expires unanswered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncExpiryPolicy {
    /// Lift the pause on dependents and park the task behind an ASYNC blocker
    Escalate,
    /// Fail the task and every dependent the blocker paused
    FailChain,
}

impl SyncExpiryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncExpiryPolicy::Escalate => "escalate",
            SyncExpiryPolicy::FailChain => "fail_chain",
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency ceiling for the agent pool
    pub max_agents: usize,
    pub hot_budget_tokens: u64,
    pub warm_budget_tokens: u64,
    /// Hard cap of the COLD tier; items beyond it are evicted
    pub cold_capacity_tokens: u64,
    pub max_context_files: usize,
    pub max_context_symbols: usize,
    pub generation_timeout_secs: u64,
    /// Retries of transient provider errors within one generation call
    pub provider_retries: u32,
    pub provider_backoff_ms: u64,
    /// Program and arguments of the project's test command
    pub test_command: Vec<String>,
    pub test_timeout_secs: u64,
    pub max_correction_attempts: u32,
    pub blocker_ttl_secs: u64,
    pub blocker_sweep_interval_secs: u64,
    pub max_answer_length: usize,
    pub max_question_length: usize,
    pub sync_expiry_policy: SyncExpiryPolicy,
    /// Program and arguments of the command-backed code generator
    pub generator_command: Option<Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            hot_budget_tokens: 4_000,
            warm_budget_tokens: 12_000,
            cold_capacity_tokens: 40_000,
            max_context_files: 20,
            max_context_symbols: 50,
            generation_timeout_secs: 300,
            provider_retries: 2,
            provider_backoff_ms: 500,
            test_command: vec!["cargo".to_string(), "test".to_string()],
            test_timeout_secs: 600,
            max_correction_attempts: 3,
            blocker_ttl_secs: 86_400,
            blocker_sweep_interval_secs: 60,
            max_answer_length: 5_000,
            max_question_length: 2_000,
            sync_expiry_policy: SyncExpiryPolicy::Escalate,
            generator_command: None,
        }
    }
}

/// Partial configuration update
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigUpdate {
    pub max_agents: Option<usize>,
    pub hot_budget_tokens: Option<u64>,
    pub warm_budget_tokens: Option<u64>,
    pub cold_capacity_tokens: Option<u64>,
    pub generation_timeout_secs: Option<u64>,
    pub test_command: Option<Vec<String>>,
    pub test_timeout_secs: Option<u64>,
    pub blocker_ttl_secs: Option<u64>,
    pub sync_expiry_policy: Option<SyncExpiryPolicy>,
    pub generator_command: Option<Vec<String>>,
}

impl OrchestratorConfig {
    /// Apply a partial update to the configuration
    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(max_agents) = update.max_agents {
            self.max_agents = max_agents;
        }
        if let Some(budget) = update.hot_budget_tokens {
            self.hot_budget_tokens = budget;
        }
        if let Some(budget) = update.warm_budget_tokens {
            self.warm_budget_tokens = budget;
        }
        if let Some(capacity) = update.cold_capacity_tokens {
            self.cold_capacity_tokens = capacity;
        }
        if let Some(secs) = update.generation_timeout_secs {
            self.generation_timeout_secs = secs;
        }
        if let Some(command) = update.test_command {
            self.test_command = command;
        }
        if let Some(secs) = update.test_timeout_secs {
            self.test_timeout_secs = secs;
        }
        if let Some(ttl) = update.blocker_ttl_secs {
            self.blocker_ttl_secs = ttl;
        }
        if let Some(policy) = update.sync_expiry_policy {
            self.sync_expiry_policy = policy;
        }
        if let Some(command) = update.generator_command {
            self.generator_command = Some(command);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=64).contains(&self.max_agents) {
            return Err(format!(
                "max_agents must be between 1 and 64, got {}",
                self.max_agents
            ));
        }

        if self.hot_budget_tokens == 0
            || self.warm_budget_tokens == 0
            || self.cold_capacity_tokens == 0
        {
            return Err("context tier budgets must be greater than zero".to_string());
        }

        if !(1..=3).contains(&self.max_correction_attempts) {
            return Err("max_correction_attempts must be between 1 and 3".to_string());
        }

        if self.test_command.is_empty() {
            return Err("test_command cannot be empty".to_string());
        }

        if matches!(&self.generator_command, Some(command) if command.is_empty()) {
            return Err("generator_command cannot be empty".to_string());
        }

        if self.generation_timeout_secs == 0 || self.test_timeout_secs == 0 {
            return Err("timeouts must be at least 1 second".to_string());
        }

        if self.blocker_ttl_secs == 0 || self.blocker_sweep_interval_secs == 0 {
            return Err("blocker TTL and sweep interval must be at least 1 second".to_string());
        }

        if self.max_answer_length == 0 || self.max_question_length == 0 {
            return Err("answer and question length limits must be positive".to_string());
        }

        Ok(())
    }
}
