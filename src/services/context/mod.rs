//! Context Tier Store
//!
//! Per-agent HOT/WARM/COLD context cache under token budgets.

mod scoring;
mod store;

pub use scoring::{estimate_tokens, importance_score, tier_for_score};
pub use store::{ContextTierStore, SharedContextStore, TierBudgets};
