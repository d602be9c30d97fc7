//! File Change Application
//!
//! Applies generator output to the project tree. Every path is validated
//! before anything is written; each write goes to a temp file in the target
//! directory and is renamed into place.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use conductor_core::{FileAction, FileChange};
use tempfile::NamedTempFile;

use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::STATE_DIR_NAME;

/// Resolve a generator-supplied path against the project root.
///
/// Rejects empty and absolute paths, `..` components, and anything inside
/// the orchestrator's own state directory.
pub fn validate_change_path(project_root: &Path, path: &str) -> AppResult<PathBuf> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("File change has an empty path"));
    }
    let relative = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(AppError::validation(format!(
                    "Path traversal rejected: {}",
                    path
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::validation(format!(
                    "Absolute path rejected: {}",
                    path
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AppError::validation(format!("Path names no file: {}", path)));
    }
    if clean.starts_with(STATE_DIR_NAME) {
        return Err(AppError::validation(format!(
            "Path inside the state directory rejected: {}",
            path
        )));
    }
    Ok(project_root.join(clean))
}

/// Apply a batch of changes; returns the relative paths touched.
///
/// The whole batch is validated first, so one bad path writes nothing.
pub fn apply_changes(project_root: &Path, changes: &[FileChange]) -> AppResult<Vec<String>> {
    let resolved = changes
        .iter()
        .map(|change| validate_change_path(project_root, &change.path).map(|p| (p, change)))
        .collect::<AppResult<Vec<_>>>()?;

    let mut touched = Vec::with_capacity(resolved.len());
    for (target, change) in resolved {
        match change.action {
            FileAction::Create | FileAction::Modify => write_atomic(&target, &change.content)?,
            FileAction::Delete => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
            }
        }
        tracing::debug!(path = %change.path, action = ?change.action, "Applied file change");
        let relative = target
            .strip_prefix(project_root)
            .unwrap_or(&target)
            .to_string_lossy()
            .replace('\\', "/");
        if !touched.contains(&relative) {
            touched.push(relative);
        }
    }
    Ok(touched)
}

fn write_atomic(target: &Path, content: &str) -> AppResult<()> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::validation(format!("No parent directory for {}", target.display())))?;
    std::fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}
