//! Conductor Core
//!
//! Foundational error types and external-collaborator traits for the Conductor
//! workspace. This crate has zero dependencies on application-level code
//! (database, scheduler, process adapters, etc.).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`, `ProviderError`)
//! - `collaborators` - `CodeGenerator`, `TestRunner`, `VersionControl` and their wire types

pub mod collaborators;
pub mod error;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult, ProviderError};

// ── External Collaborators ─────────────────────────────────────────────
pub use collaborators::{
    CodeGenerator, ContextSnippet, DiffStats, FileAction, FileChange, GeneratedQuestion,
    GenerationRequest, GenerationResponse, TestReport, TestRunner, VersionControl,
};
