//! Project Path Utilities
//!
//! Resolves the orchestrator's per-project state directory:
//! `<project>/.conductor/{config.json, state.db, checkpoints/}`.

use std::path::{Path, PathBuf};

use crate::utils::error::AppResult;

/// Name of the state directory inside a project root
pub const STATE_DIR_NAME: &str = ".conductor";

/// Get the state directory (<project>/.conductor/)
pub fn state_dir(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR_NAME)
}

/// Get the config file path (<project>/.conductor/config.json)
pub fn config_path(project_root: &Path) -> PathBuf {
    state_dir(project_root).join("config.json")
}

/// Get the database file path (<project>/.conductor/state.db)
pub fn database_path(project_root: &Path) -> PathBuf {
    state_dir(project_root).join("state.db")
}

/// Get the checkpoints directory (<project>/.conductor/checkpoints/)
pub fn checkpoints_dir(project_root: &Path) -> PathBuf {
    state_dir(project_root).join("checkpoints")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the state directory, creating it if it doesn't exist
pub fn ensure_state_dir(project_root: &Path) -> AppResult<PathBuf> {
    let path = state_dir(project_root);
    ensure_dir(&path)?;
    Ok(path)
}

/// Get the checkpoints directory, creating it if it doesn't exist
pub fn ensure_checkpoints_dir(project_root: &Path) -> AppResult<PathBuf> {
    let path = checkpoints_dir(project_root);
    ensure_dir(&path)?;
    Ok(path)
}
