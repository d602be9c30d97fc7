//! Importance Scoring
//!
//! score = 0.5 * recency + 0.3 * reference + 0.2 * pinned
//!
//! - recency halves every 24 hours since last access
//! - reference grows logarithmically with access count, saturating at 10 accesses
//! - pinned is 1 for pinned items, else 0
//!
//! An accessed item is placed by its score: HOT from 0.8, WARM from 0.4,
//! COLD below.

use chrono::{DateTime, Utc};

use crate::models::{ContextItem, ContextTier};

pub const RECENCY_WEIGHT: f64 = 0.5;
pub const REFERENCE_WEIGHT: f64 = 0.3;
pub const PINNED_WEIGHT: f64 = 0.2;
pub const RECENCY_HALF_LIFE_HOURS: f64 = 24.0;
/// Access count at which the reference term saturates
pub const REFERENCE_SATURATION: f64 = 10.0;
pub const HOT_THRESHOLD: f64 = 0.8;
pub const WARM_THRESHOLD: f64 = 0.4;
const BOUNDARY_TOLERANCE: f64 = 1e-9;

pub fn recency(last_accessed: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = ((now - last_accessed).num_milliseconds().max(0) as f64) / 3_600_000.0;
    (-age_hours * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_HOURS).exp()
}

pub fn reference(access_count: u32) -> f64 {
    ((1.0 + f64::from(access_count)).ln() / (1.0 + REFERENCE_SATURATION).ln()).min(1.0)
}

/// Importance in [0, 1]
pub fn importance_score(item: &ContextItem, now: DateTime<Utc>) -> f64 {
    let pinned = if item.pinned { 1.0 } else { 0.0 };
    let score = RECENCY_WEIGHT * recency(item.last_accessed, now)
        + REFERENCE_WEIGHT * reference(item.access_count)
        + PINNED_WEIGHT * pinned;
    score.clamp(0.0, 1.0)
}

/// Tier an item belongs in by score; boundary scores take the higher tier
pub fn tier_for_score(score: f64) -> ContextTier {
    if score + BOUNDARY_TOLERANCE >= HOT_THRESHOLD {
        ContextTier::Hot
    } else if score + BOUNDARY_TOLERANCE >= WARM_THRESHOLD {
        ContextTier::Warm
    } else {
        ContextTier::Cold
    }
}

/// Rough token count: one token per four characters, at least one
pub fn estimate_tokens(content: &str) -> u32 {
    let chars = content.chars().count() / 4;
    u32::try_from(chars).unwrap_or(u32::MAX).max(1)
}
