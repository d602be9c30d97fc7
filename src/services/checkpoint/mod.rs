//! Checkpoints
//!
//! - `git` - `VersionControl` over the git CLI
//! - `manager` - create / diff / two-phase restore of code plus orchestration state

mod git;
mod manager;

pub use git::{parse_numstat, GitBackend};
pub use manager::CheckpointManager;
