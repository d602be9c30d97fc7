//! Core Error Types
//!
//! Defines the foundational error types used across the Conductor workspace.
//! These error types are dependency-free (only thiserror + std) to keep the core
//! crate lightweight.
//!
//! The main crate extends these with storage and orchestration variants
//! (e.g., Sqlite, DependencyCycle, RestoreIntegrity).

use thiserror::Error;

/// Errors raised by the code-generation provider.
///
/// Timeouts and rate limits are transient: the caller may retry them within
/// its own attempt budget. Everything else is final for the current call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The call did not finish within its bounded timeout
    #[error("generation call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The provider asked us to back off
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// The provider returned an error
    #[error("provider failed: {0}")]
    Failed(String),

    /// The provider answered, but not with `{files, explanation}`
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether a retry within the same attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. } | ProviderError::RateLimited(_))
    }
}

/// Core error type for the Conductor workspace.
#[derive(Error, Debug)]
pub enum CoreError {
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

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Code-generation provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
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

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
