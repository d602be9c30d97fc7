//! JSON Configuration Management
//!
//! Handles reading and writing `<project>/.conductor/config.json`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::models::settings::{ConfigUpdate, OrchestratorConfig};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_state_dir};

/// Configuration service for orchestrator settings
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: OrchestratorConfig,
}

impl ConfigService {
    /// Load the project's config, creating it with defaults if missing
    pub fn load_or_create(project_root: &Path) -> AppResult<Self> {
        ensure_state_dir(project_root)?;

        let config_path = config_path(project_root);
        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            let default_config = OrchestratorConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            tracing::info!(path = %config_path.display(), "Created default config");
            default_config
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> AppResult<OrchestratorConfig> {
        let content = fs::read_to_string(path)?;
        let config: OrchestratorConfig = serde_json::from_str(&content)
            .map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))?;
        config.validate().map_err(AppError::config)?;
        Ok(config)
    }

    /// Save configuration to a file with pretty formatting
    fn save_to_file(path: &Path, config: &OrchestratorConfig) -> AppResult<()> {
        config.validate().map_err(AppError::config)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the current configuration
    pub fn get_config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Update the configuration with a partial update
    pub fn update_config(&mut self, update: ConfigUpdate) -> AppResult<OrchestratorConfig> {
        let mut candidate = self.config.clone();
        candidate.apply_update(update);
        Self::save_to_file(&self.config_path, &candidate)?;
        self.config = candidate;
        Ok(self.config.clone())
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> AppResult<()> {
        self.config = Self::load_from_file(&self.config_path)?;
        Ok(())
    }
}
