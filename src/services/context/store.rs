//! Context Tier Store
//!
//! One agent's context cache in three tiers under token budgets. New and
//! re-inserted items enter HOT, and an accessed item moves to the tier its
//! score earns. Overflow demotes the lowest-scoring items a tier down, and
//! COLD overflow is evicted. Every mutation is written through
//! to the `context_items` table when the store is backed by a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::models::{ContextItem, ContextStats, ContextTier, OrchestratorConfig, TierStats};
use crate::storage::Database;
use crate::utils::error::AppResult;

use super::scoring::{estimate_tokens, importance_score, tier_for_score};

/// A store shared between the pool and the agent's current worker
pub type SharedContextStore = Arc<Mutex<ContextTierStore>>;

/// Token budget per tier; COLD's is a hard cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBudgets {
    pub hot: u64,
    pub warm: u64,
    pub cold: u64,
}

impl TierBudgets {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            hot: config.hot_budget_tokens,
            warm: config.warm_budget_tokens,
            cold: config.cold_capacity_tokens,
        }
    }

    fn of(&self, tier: ContextTier) -> u64 {
        match tier {
            ContextTier::Hot => self.hot,
            ContextTier::Warm => self.warm,
            ContextTier::Cold => self.cold,
        }
    }
}

impl Default for TierBudgets {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Keys touched by one mutation, for write-through
#[derive(Debug, Default)]
struct Changes {
    upserted: HashSet<String>,
    removed: HashSet<String>,
}

impl Changes {
    fn upsert(&mut self, key: &str) {
        self.removed.remove(key);
        self.upserted.insert(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.upserted.remove(key);
        self.removed.insert(key.to_string());
    }
}

#[derive(Debug)]
pub struct ContextTierStore {
    agent_id: String,
    budgets: TierBudgets,
    items: HashMap<String, ContextItem>,
    evicted: u64,
    db: Option<Database>,
}

impl ContextTierStore {
    /// Memory-only store
    pub fn new(agent_id: impl Into<String>, budgets: TierBudgets) -> Self {
        Self {
            agent_id: agent_id.into(),
            budgets,
            items: HashMap::new(),
            evicted: 0,
            db: None,
        }
    }

    /// Open the agent's persisted store, rebalancing against the current budgets.
    pub fn open(db: Database, agent_id: impl Into<String>, budgets: TierBudgets) -> AppResult<Self> {
        let agent_id = agent_id.into();
        let items = db
            .load_context_items(&agent_id)?
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();
        let mut store = Self {
            agent_id,
            budgets,
            items,
            evicted: 0,
            db: Some(db),
        };
        let mut changes = Changes::default();
        store.rebalance_into(Utc::now(), &mut changes);
        store.persist(changes)?;
        Ok(store)
    }

    pub fn shared(self) -> SharedContextStore {
        Arc::new(Mutex::new(self))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn budgets(&self) -> TierBudgets {
        self.budgets
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace an item, estimating its token count from the content.
    pub fn insert(&mut self, key: &str, content: impl Into<String>, pinned: bool) -> AppResult<()> {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        self.insert_with_tokens(key, content, tokens, pinned)
    }

    /// Insert or replace an item with an explicit token count.
    ///
    /// Replacing keeps the item's access history and moves it back to HOT.
    pub fn insert_with_tokens(
        &mut self,
        key: &str,
        content: impl Into<String>,
        token_count: u32,
        pinned: bool,
    ) -> AppResult<()> {
        let now = Utc::now();
        let content = content.into();
        let item = match self.items.remove(key) {
            Some(mut existing) => {
                existing.content = content;
                existing.token_count = token_count.max(1);
                existing.pinned = pinned;
                existing.tier = ContextTier::Hot;
                existing.last_accessed = now;
                existing
            }
            None => ContextItem {
                agent_id: self.agent_id.clone(),
                key: key.to_string(),
                content,
                tier: ContextTier::Hot,
                token_count: token_count.max(1),
                importance_score: 0.0,
                pinned,
                access_count: 0,
                last_accessed: now,
                created_at: now,
            },
        };
        self.items.insert(key.to_string(), item);

        let mut changes = Changes::default();
        changes.upsert(key);
        self.rebalance_into(now, &mut changes);
        self.persist(changes)
    }

    /// Look up an item, counting the access, rescoring it and moving it to
    /// the tier its score earns. Budgets are enforced afterwards, so the
    /// returned item may already sit a tier lower.
    pub fn access(&mut self, key: &str) -> AppResult<Option<ContextItem>> {
        let now = Utc::now();
        let Some(item) = self.items.get_mut(key) else {
            return Ok(None);
        };
        item.access_count = item.access_count.saturating_add(1);
        item.last_accessed = now;
        item.importance_score = importance_score(item, now);
        let tier = tier_for_score(item.importance_score);
        if tier != item.tier {
            tracing::debug!(agent_id = %self.agent_id, key = %key, from = item.tier.as_str(), to = tier.as_str(), score = item.importance_score, "Context item retiered");
            item.tier = tier;
        }

        let mut changes = Changes::default();
        changes.upsert(key);
        self.rebalance_into(now, &mut changes);
        self.persist(changes)?;
        Ok(self.items.get(key).cloned())
    }

    /// Look up an item without counting an access
    pub fn peek(&self, key: &str) -> Option<&ContextItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> AppResult<Option<ContextItem>> {
        let removed = self.items.remove(key);
        if removed.is_some() {
            let mut changes = Changes::default();
            changes.remove(key);
            self.persist(changes)?;
        }
        Ok(removed)
    }

    fn rebalance_into(&mut self, now: DateTime<Utc>, changes: &mut Changes) {
        for item in self.items.values_mut() {
            let score = importance_score(item, now);
            if (score - item.importance_score).abs() > f64::EPSILON {
                item.importance_score = score;
                changes.upsert(&item.key);
            }
        }

        for tier in [ContextTier::Hot, ContextTier::Warm, ContextTier::Cold] {
            let budget = self.budgets.of(tier);
            let mut total = self.tier_stats(tier).tokens;
            if total <= budget {
                continue;
            }
            for key in self.demotion_order(tier) {
                if total <= budget {
                    break;
                }
                let Some(item) = self.items.get_mut(&key) else {
                    continue;
                };
                total = total.saturating_sub(u64::from(item.token_count));
                match tier.demoted() {
                    Some(lower) => {
                        tracing::debug!(agent_id = %self.agent_id, key = %key, from = tier.as_str(), to = lower.as_str(), "Context item demoted");
                        item.tier = lower;
                        changes.upsert(&key);
                    }
                    None => {
                        tracing::debug!(agent_id = %self.agent_id, key = %key, "Context item evicted");
                        self.items.remove(&key);
                        self.evicted += 1;
                        changes.remove(&key);
                    }
                }
            }
        }
    }

    /// Keys of a tier, lowest score first; ties go to the least recently
    /// accessed, then by key.
    fn demotion_order(&self, tier: ContextTier) -> Vec<String> {
        let mut candidates: Vec<&ContextItem> =
            self.items.values().filter(|i| i.tier == tier).collect();
        candidates.sort_by(|a, b| {
            a.importance_score
                .total_cmp(&b.importance_score)
                .then(a.last_accessed.cmp(&b.last_accessed))
                .then(a.key.cmp(&b.key))
        });
        candidates.into_iter().map(|i| i.key.clone()).collect()
    }

    fn persist(&self, changes: Changes) -> AppResult<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        for key in &changes.upserted {
            if let Some(item) = self.items.get(key) {
                db.upsert_context_item(item)?;
            }
        }
        for key in &changes.removed {
            db.delete_context_item(&self.agent_id, key)?;
        }
        Ok(())
    }

    pub fn tier_stats(&self, tier: ContextTier) -> TierStats {
        self.items
            .values()
            .filter(|i| i.tier == tier)
            .fold(TierStats::default(), |acc, i| TierStats {
                count: acc.count + 1,
                tokens: acc.tokens + u64::from(i.token_count),
            })
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            hot: self.tier_stats(ContextTier::Hot),
            warm: self.tier_stats(ContextTier::Warm),
            cold: self.tier_stats(ContextTier::Cold),
            evicted: self.evicted,
        }
    }

    /// Items of one tier, highest score first
    pub fn items_in(&self, tier: ContextTier) -> Vec<&ContextItem> {
        let mut items: Vec<&ContextItem> =
            self.items.values().filter(|i| i.tier == tier).collect();
        items.sort_by(|a, b| {
            b.importance_score
                .total_cmp(&a.importance_score)
                .then(a.key.cmp(&b.key))
        });
        items
    }

    pub fn hot_items(&self) -> Vec<&ContextItem> {
        self.items_in(ContextTier::Hot)
    }

    /// Token total the agent currently carries in its prompt context
    pub fn hot_tokens(&self) -> u64 {
        self.tier_stats(ContextTier::Hot).tokens
    }
}
