//! Context Building
//!
//! Collects the files a task is likely to touch, feeds them and their
//! declared symbols into the agent's tier store, and hands the generator a
//! bounded selection of HOT items.

use std::path::Path;
use std::sync::OnceLock;

use conductor_core::ContextSnippet;
use regex::Regex;

use crate::models::{ContextItem, OrchestratorConfig, Task};
use crate::services::context::ContextTierStore;
use crate::utils::error::AppResult;

use super::apply::validate_change_path;
use super::symbols::{parse_symbols, CodeSymbol};

pub const FILE_KEY_PREFIX: &str = "file:";
pub const SYMBOL_KEY_PREFIX: &str = "symbol:";

/// Caps on what one generation request may carry
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_files: usize,
    pub max_symbols: usize,
    /// Larger files are truncated before caching
    pub max_file_bytes: usize,
}

impl ContextLimits {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_files: config.max_context_files,
            max_symbols: config.max_context_symbols,
            max_file_bytes: 16 * 1024,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

fn path_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?:[A-Za-z0-9_\-]+/)*[A-Za-z0-9_\-]+\.(?:rs|py|ts|tsx|js|jsx|go|java|css|scss|html|vue|svelte|toml|json|ya?ml|sql|md)\b").ok()
        })
        .as_ref()
}

/// Path-like tokens mentioned in free text, in order of first mention
pub fn mentioned_paths(text: &str) -> Vec<String> {
    let Some(pattern) = path_pattern() else {
        return Vec::new();
    };
    let mut paths: Vec<String> = Vec::new();
    for m in pattern.find_iter(text) {
        let path = m.as_str().to_string();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Context key of a symbol, qualified by the file declaring it
pub fn symbol_key(path: &str, symbol: &CodeSymbol) -> String {
    format!("{}{}:{}", SYMBOL_KEY_PREFIX, path, symbol.qualified_name())
}

fn truncate_utf8(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// Feed the task's candidate files into `store` and return the bounded
/// selection of HOT items for the generation request.
///
/// Candidates are `seed_files` (typically what completed dependencies
/// produced), paths mentioned in the task text (pinned), and `hints` from the
/// specialist. Missing or unsafe paths are skipped.
pub fn build_context(
    store: &mut ContextTierStore,
    project_root: &Path,
    task: &Task,
    seed_files: &[String],
    hints: &[String],
    limits: ContextLimits,
) -> AppResult<Vec<ContextSnippet>> {
    let mentioned = mentioned_paths(&format!("{}\n{}", task.title, task.description));
    let mut candidates: Vec<(String, bool)> = Vec::new();
    for (path, pinned) in mentioned
        .iter()
        .map(|p| (p, true))
        .chain(seed_files.iter().map(|p| (p, false)))
        .chain(hints.iter().map(|p| (p, false)))
    {
        if !candidates.iter().any(|(c, _)| c == path) {
            candidates.push((path.clone(), pinned));
        }
    }

    for (path, pinned) in candidates.iter().take(limits.max_files.max(1) * 2) {
        let Ok(full) = validate_change_path(project_root, path) else {
            continue;
        };
        let Ok(content) = std::fs::read_to_string(&full) else {
            continue;
        };
        let content = truncate_utf8(&content, limits.max_file_bytes);
        store.insert(&format!("{}{}", FILE_KEY_PREFIX, path), content, *pinned)?;
        for symbol in parse_symbols(path, content, limits.max_symbols) {
            store.insert(
                &symbol_key(path, &symbol),
                format!("{}  // {}:{}", symbol.signature, path, symbol.line),
                false,
            )?;
        }
    }

    let (mut files, mut symbols) = (0usize, 0usize);
    let selected: Vec<String> = store
        .hot_items()
        .into_iter()
        .filter(|item: &&ContextItem| {
            if item.key.starts_with(FILE_KEY_PREFIX) && files < limits.max_files {
                files += 1;
                true
            } else if item.key.starts_with(SYMBOL_KEY_PREFIX) && symbols < limits.max_symbols {
                symbols += 1;
                true
            } else {
                false
            }
        })
        .map(|item| item.key.clone())
        .collect();

    let mut snippets = Vec::with_capacity(selected.len());
    for key in selected {
        if let Some(item) = store.access(&key)? {
            snippets.push(ContextSnippet {
                key: item.key,
                content: item.content,
            });
        }
    }
    tracing::debug!(
        task_id = task.id,
        agent_id = store.agent_id(),
        files,
        symbols,
        hot_tokens = store.hot_tokens(),
        "Context built"
    );
    Ok(snippets)
}
