//! Configuration management for manubuild

pub mod schema;

pub use schema::Config;

use crate::error::{ManuError, ManuResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Project-local config file name
pub const LOCAL_CONFIG_NAME: &str = "manubuild.toml";

/// Per-project state directory name
pub const STATE_DIR_NAME: &str = ".manubuild";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("manubuild")
            .join("config.toml")
    }

    /// Get the per-project state directory
    pub fn state_dir(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR_NAME)
    }

    /// Get the local cache tier root for a project
    pub fn cache_dir(config: &Config, project_root: &Path) -> PathBuf {
        match &config.cache.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => Self::state_dir(project_root).join("cache"),
        }
    }

    /// Get the persisted hash memo path for a project
    pub fn hash_memo_path(project_root: &Path) -> PathBuf {
        Self::state_dir(project_root).join("hashes.json")
    }

    /// Walk up from `start` looking for a project-local config file
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> ManuResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ManuResult<Config> {
        let value = Self::read_value(path).await?;
        value.try_into().map_err(|e: toml::de::Error| ManuError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the global config with a project-local file layered on top.
    ///
    /// Tables are merged key by key; any other local value replaces the
    /// global one.
    pub async fn load_merged(&self, local: Option<&Path>) -> ManuResult<Config> {
        let mut merged = if self.config_path.exists() {
            Self::read_value(&self.config_path).await?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };

        if let Some(path) = local {
            debug!("Merging local config {}", path.display());
            let overlay = Self::read_value(path).await?;
            merge_values(&mut merged, overlay);
        }

        merged.try_into().map_err(|e: toml::de::Error| ManuError::ConfigInvalid {
            path: local.unwrap_or(&self.config_path).to_path_buf(),
            reason: e.to_string(),
        })
    }

    async fn read_value(path: &Path) -> ManuResult<toml::Value> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ManuError::io(format!("reading config from {}", path.display()), e))?;

        content
            .parse::<toml::Value>()
            .map_err(|e| ManuError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ManuResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ManuError::io(format!("creating config directory {}", parent.display()), e)
            })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ManuError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Whether we are running inside a CI runner
pub fn is_ci() -> bool {
    std::env::var("CI").map(|v| v == "true").unwrap_or(false)
}

/// Detect the git branch the build runs on.
///
/// `MANUBUILD_BRANCH` wins, then `GITHUB_REF_NAME`, then git itself.
pub async fn detect_branch(project_root: &Path) -> Option<String> {
    for var in ["MANUBUILD_BRANCH", "GITHUB_REF_NAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(project_root)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}
