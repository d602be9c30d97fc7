//! Error Handling
//!
//! Unified error types for the orchestrator.
//! Uses thiserror for ergonomic error definitions.

use conductor_core::{CoreError, ProviderError};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Command execution errors (git, test runner, generator process)
    #[error("Command error: {0}")]
    Command(String),

    /// Malformed task, disallowed file path, bad answer. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generation-call timeout or rate limit, retried within the attempt's budget
    #[error("Transient provider error: {0}")]
    TransientProvider(ProviderError),

    /// Non-transient provider failure
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Dependency cycle found at graph construction
    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    /// A blocker expired before it was answered
    #[error("Blocker {blocker_id} expired")]
    BlockerExpired { blocker_id: i64 },

    /// Checkpoint restore aborted; the system remains in its pre-restore state
    #[error("Restore integrity error: {0}")]
    RestoreIntegrity(String),

    /// A compare-and-set lost to a concurrent writer or hit a terminal row
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cooperative cancellation was honored
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a restore integrity error
    pub fn restore_integrity(msg: impl Into<String>) -> Self {
        Self::RestoreIntegrity(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify a provider error into the transient / final split
    pub fn from_provider(err: ProviderError) -> Self {
        if err.is_transient() {
            Self::TransientProvider(err)
        } else {
            Self::Provider(err)
        }
    }

    /// Whether the error may succeed on retry within the same attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientProvider(_))
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Config(msg) => AppError::Config(msg),
            CoreError::Io(e) => AppError::Io(e),
            CoreError::Serialization(e) => AppError::Serialization(e),
            CoreError::Command(msg) => AppError::Command(msg),
            CoreError::Validation(msg) => AppError::Validation(msg),
            CoreError::NotFound(msg) => AppError::NotFound(msg),
            CoreError::Provider(e) => AppError::from_provider(e),
            CoreError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::database(format!("Failed to get connection: {}", err))
    }
}
