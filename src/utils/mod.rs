//! Utilities
//!
//! Common utilities used throughout the orchestrator.

pub mod error;
pub mod paths;

pub use error::*;
pub use paths::*;
