//! Configuration schema for manubuild
//!
//! Project configuration lives in `manubuild.toml`; a global file at
//! `~/.config/manubuild/config.toml` supplies user-wide defaults.

use crate::dataset::DatasetEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local and remote cache settings
    pub cache: CacheConfig,

    /// Build execution settings
    pub build: BuildConfig,

    /// Command templates keyed by script extension
    pub scripts: ScriptsConfig,

    /// User-declared dependencies: file -> files it depends on
    pub dependencies: BTreeMap<PathBuf, Vec<PathBuf>>,

    /// External datasets keyed by archive identifier
    pub datasets: BTreeMap<String, DatasetEntry>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching (default: true)
    pub enabled: bool,

    /// Local cache tier root (default: `<project>/.manubuild/cache`)
    pub dir: Option<PathBuf>,

    /// Skip restoring cached rules whose consumers are all cached
    pub optimize: bool,

    /// Allow cacheable rules to be recomputed on CI after a remote miss
    pub run_cacheable_on_ci: bool,

    /// Remote archive tier
    pub remote: RemoteConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            optimize: false,
            run_cacheable_on_ci: false,
            remote: RemoteConfig::default(),
        }
    }
}

/// Remote archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Query and populate the remote tier
    pub enabled: bool,

    /// Base URL of the archive service API
    pub url: String,

    /// Environment variable holding the access token
    pub token_env: String,

    /// Deposit used when neither the rule nor the branch names one
    pub deposit: Option<String>,

    /// Per-branch deposits
    pub branches: BTreeMap<String, String>,

    /// Treat remote tier failures as fatal
    pub required: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://zenodo.org/api".to_string(),
            token_env: "ZENODO_TOKEN".to_string(),
            deposit: None,
            branches: BTreeMap::new(),
            required: false,
        }
    }
}

impl RemoteConfig {
    /// Pick the deposit for a branch, falling back to the default deposit
    pub fn deposit_for(&self, branch: Option<&str>) -> Option<&str> {
        branch
            .and_then(|b| self.branches.get(b))
            .or(self.deposit.as_ref())
            .map(String::as_str)
    }
}

/// Build execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Worker pool size (default: available parallelism)
    pub jobs: Option<usize>,

    /// Rule ids to rebuild regardless of cache state
    pub force: Vec<String>,

    /// Fail before execution when a leaf input is missing
    pub require_inputs: bool,

    /// Where to write the JSON execution report
    pub report: Option<PathBuf>,

    /// Shell used to run rule commands
    pub shell: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            force: vec![],
            require_inputs: true,
            report: None,
            shell: "sh".to_string(),
        }
    }
}

impl BuildConfig {
    /// Effective worker pool size
    pub fn effective_jobs(&self) -> usize {
        self.jobs
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}

/// Script command templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptsConfig(pub BTreeMap<String, String>);

impl Default for ScriptsConfig {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert("py".to_string(), "python {script}".to_string());
        Self(templates)
    }
}

impl ScriptsConfig {
    /// Template for a script extension
    pub fn template(&self, extension: &str) -> Option<&str> {
        self.0.get(extension).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("[build]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.cache.enabled);
        assert!(!config.cache.optimize);
        assert!(config.build.require_inputs);
        assert_eq!(config.scripts.template("py"), Some("python {script}"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            optimize = true

            [cache.remote]
            enabled = true
            deposit = "1234"

            [cache.remote.branches]
            paper-v2 = "5678"

            [build]
            jobs = 4
            force = ["fig1"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.cache.optimize);
        assert!(config.cache.enabled); // default preserved
        assert_eq!(config.build.effective_jobs(), 4);
        assert_eq!(config.build.force, vec!["fig1"]);
        assert_eq!(config.cache.remote.deposit_for(Some("paper-v2")), Some("5678"));
        assert_eq!(config.cache.remote.deposit_for(Some("main")), Some("1234"));
        assert_eq!(config.cache.remote.deposit_for(None), Some("1234"));
    }

    #[test]
    fn scripts_override_keeps_only_declared() {
        let toml = r#"
            [scripts]
            jl = "julia {script}"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.scripts.template("jl"), Some("julia {script}"));
        assert_eq!(config.scripts.template("py"), None);
    }

    #[test]
    fn zero_jobs_falls_back_to_parallelism() {
        let build = BuildConfig {
            jobs: Some(0),
            ..BuildConfig::default()
        };
        assert!(build.effective_jobs() >= 1);
    }
}
