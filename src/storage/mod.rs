//! Storage Layer
//!
//! Persisted orchestration state (SQLite) and the JSON config file.

pub mod config;
pub mod database;

pub use config::ConfigService;
pub use database::{Database, DbPool};
