//! Error types for manubuild
//!
//! All modules use `ManuResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for manubuild operations
pub type ManuResult<T> = Result<T, ManuError>;

/// All errors that can occur in manubuild
#[derive(Error, Debug)]
pub enum ManuError {
    // Graph errors
    #[error("Dependency cycle between rules: {}", rules.join(" -> "))]
    Cycle { rules: Vec<String> },

    #[error("Rule declared twice: {0}")]
    DuplicateRule(String),

    #[error("Output {path} is produced by both {first} and {second}")]
    DuplicateOutput {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    #[error("Input {path} of rule {rule} does not exist and no rule produces it")]
    MissingInput { rule: String, path: PathBuf },

    // Cache errors
    #[error("Remote cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("Rule {rule} missed the remote cache and recomputation is not allowed here")]
    RemoteCacheRequired { rule: String },

    #[error("Corrupt cache entry {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },

    // Dataset errors
    #[error("File {name} not found in archive {deposit}")]
    MissingRemoteFile { deposit: String, name: String },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Archive error in {name}: {reason}")]
    Archive { name: String, reason: String },

    // Execution errors
    #[error("Rule {rule} failed: {reason}")]
    RuleExecution { rule: String, reason: String },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ManuError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a rule execution error
    pub fn rule_failed(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RuleExecution {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Create a remote tier error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            reason: reason.into(),
        }
    }

    /// Errors that signal a malformed build and can never be downgraded to a warning
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::HashMismatch { .. }
                | Self::DuplicateRule(_)
                | Self::DuplicateOutput { .. }
        )
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheUnavailable { .. } | Self::Http(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Cycle { .. } => Some("Check the inputs and outputs of the listed rules"),
            Self::RemoteCacheRequired { .. } => {
                Some("Run the build locally to populate the cache, or set cache.run_cacheable_on_ci = true")
            }
            Self::CacheUnavailable { .. } => {
                Some("Check cache.remote.url and the token, or set cache.remote.required = false")
            }
            Self::HashMismatch { .. } => {
                Some("The archived file changed upstream; update the pinned sha256 if this is expected")
            }
            Self::ConfigNotFound(_) => Some("Run: manubuild config init"),
            _ => None,
        }
    }
}
