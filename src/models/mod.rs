//! Data Models
//!
//! Contains all data structures used throughout the orchestrator.

pub mod agent;
pub mod blocker;
pub mod checkpoint;
pub mod context;
pub mod correction;
pub mod settings;
pub mod task;

pub use agent::*;
pub use blocker::*;
pub use checkpoint::*;
pub use context::*;
pub use correction::*;
pub use settings::*;
pub use task::*;
