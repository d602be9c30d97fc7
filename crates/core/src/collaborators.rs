//! External Collaborators
//!
//! Traits for the opaque services the orchestrator consumes but does not own:
//!
//! - `CodeGenerator` - prompt in, `{files, explanation}` out; may time out or error
//! - `TestRunner` - runs the project's test command and reports pass/fail counts
//! - `VersionControl` - commit / diff / reset of the project working tree
//!
//! The main crate ships command-backed adapters for each. Tests substitute
//! scripted in-process fakes.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, ProviderError};

// ============================================================================
// Code generation
// ============================================================================

/// Action to take on a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// One file change returned by the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the project root
    pub path: String,
    pub action: FileAction,
    /// Full new content (ignored for deletes)
    #[serde(default)]
    pub content: String,
}

impl FileChange {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Modify,
            content: content.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: String::new(),
        }
    }
}

/// A question the generator could not answer on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub text: String,
    /// Blocking questions pause the task until a human answers.
    #[serde(default)]
    pub blocking: bool,
}

/// A single piece of context handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub key: String,
    pub content: String,
}

/// Request sent to the code generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task_id: i64,
    pub title: String,
    pub description: String,
    /// Role instructions for the agent specialization
    pub role: String,
    pub context: Vec<ContextSnippet>,
    /// Present on correction attempts: the failing test output to fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Answers to earlier questions on this task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
}

/// Response from the code generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub files: Vec<FileChange>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<GeneratedQuestion>,
}

/// The code-generation provider. A single call per request; the caller
/// enforces the timeout and decides whether to retry transient errors.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
        -> Result<GenerationResponse, ProviderError>;
}

// ============================================================================
// Test runner
// ============================================================================

/// Outcome of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    pub success: bool,
    /// Combined stdout/stderr, truncated by the runner
    pub output: String,
}

impl TestReport {
    pub fn passing(passed: u32) -> Self {
        Self {
            passed,
            failed: 0,
            success: true,
            output: String::new(),
        }
    }

    pub fn failing(failed: u32, output: impl Into<String>) -> Self {
        Self {
            passed: 0,
            failed,
            success: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, project_root: &Path) -> CoreResult<TestReport>;
}

// ============================================================================
// Version control
// ============================================================================

/// Changed-file / insertion / deletion counts between two code states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Version-control backend for the project working tree.
///
/// Implementations are synchronous; callers run them off the async
/// executor where latency matters.
pub trait VersionControl: Send + Sync {
    /// Current revision id (e.g. a commit SHA)
    fn head_revision(&self) -> CoreResult<String>;

    /// Commit the entire working tree and return the new revision.
    /// Commits even when nothing changed.
    fn commit_all(&self, message: &str) -> CoreResult<String>;

    /// Diff counts between `revision` and the current working tree.
    fn diff_stats(&self, revision: &str) -> CoreResult<DiffStats>;

    /// Make the working tree exactly match `revision`.
    fn reset_hard(&self, revision: &str) -> CoreResult<()>;
}
