//! Conductor
//!
//! Orchestrates a bounded pool of code-generating agents over a
//! dependency-ordered task plan:
//! - dependency-aware scheduling with chain blocking on human questions
//! - a concurrency-capped agent pool with per-agent tiered context caches
//! - bounded self-correction on failing tests
//! - joint code + state checkpoints with all-or-nothing restore
//! - lifecycle events for any number of observers

pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

pub use state::{AppState, Collaborators, FailedTask, StatusReport};
pub use utils::error::{AppError, AppResult};
