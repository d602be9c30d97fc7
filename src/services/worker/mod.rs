//! Worker Execution
//!
//! Specialist workers and the pipeline they share.
//!
//! - `apply` - validated, atomic application of generated file changes
//! - `context` - bounded context built through the agent's tier store
//! - `generation` - timeout, retry and cancellation around the code generator
//! - `pipeline` - the per-task execution contract
//! - `specialist` - backend / frontend / test variants of the contract
//! - `symbols` - tree-sitter declarations for context

mod apply;
mod context;
mod generation;
mod pipeline;
mod specialist;
mod symbols;

pub use apply::{apply_changes, validate_change_path};
pub use context::{build_context, mentioned_paths, symbol_key, ContextLimits};
pub use generation::GenerationClient;
pub use pipeline::{run_pipeline, WorkerServices};
pub use specialist::{specialist_for, BackendWorker, FrontendWorker, Specialist, TestWorker};
pub use symbols::{parse_symbols, CodeSymbol, SourceLanguage, SymbolKind};
