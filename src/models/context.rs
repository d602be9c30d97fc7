//! Context Models
//!
//! Items of an agent's tiered context cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache tier, HOT > WARM > COLD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextTier {
    Hot,
    Warm,
    Cold,
}

impl ContextTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTier::Hot => "HOT",
            ContextTier::Warm => "WARM",
            ContextTier::Cold => "COLD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HOT" => Some(ContextTier::Hot),
            "WARM" => Some(ContextTier::Warm),
            "COLD" => Some(ContextTier::Cold),
            _ => None,
        }
    }

    /// Next tier down, `None` for COLD.
    pub fn demoted(&self) -> Option<Self> {
        match self {
            ContextTier::Hot => Some(ContextTier::Warm),
            ContextTier::Warm => Some(ContextTier::Cold),
            ContextTier::Cold => None,
        }
    }
}

/// One cached piece of context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub agent_id: String,
    pub key: String,
    pub content: String,
    pub tier: ContextTier,
    pub token_count: u32,
    /// In [0, 1]
    pub importance_score: f64,
    pub pinned: bool,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Count and token total of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub count: usize,
    pub tokens: u64,
}

/// Per-tier statistics of a context store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub hot: TierStats,
    pub warm: TierStats,
    pub cold: TierStats,
    /// Items dropped from COLD since the store was opened
    pub evicted: u64,
}

impl ContextStats {
    pub fn tier(&self, tier: ContextTier) -> TierStats {
        match tier {
            ContextTier::Hot => self.hot,
            ContextTier::Warm => self.warm,
            ContextTier::Cold => self.cold,
        }
    }

    pub fn total_items(&self) -> usize {
        self.hot.count + self.warm.count + self.cold.count
    }
}
