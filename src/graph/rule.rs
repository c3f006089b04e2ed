//! Rule descriptions
//!
//! Rules arrive from an external graph-construction stage as a JSON array:
//!
//! ```json
//! [{"id": "fig1", "inputs": ["src/data/obs.csv", "src/scripts/fig1.py"],
//!   "outputs": ["src/figures/fig1.pdf"], "specHash": "3b1f...",
//!   "cacheable": true, "script": "src/scripts/fig1.py"}]
//! ```

use crate::config::Config;
use crate::error::{ManuError, ManuResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A rule as declared in the rules file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: String,

    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    /// Opaque hash of the command/script body and parameters
    pub spec_hash: String,

    #[serde(default)]
    pub cacheable: bool,

    /// Remote deposit overriding the configured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_deposit: Option<String>,

    /// Shell command producing the outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Script run through the `[scripts]` template for its extension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
}

/// A rule ready to be placed in the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: String,

    /// Declared inputs, then the script, then user-declared dependencies
    pub inputs: Vec<PathBuf>,

    pub outputs: Vec<PathBuf>,
    pub spec_hash: String,
    pub cacheable: bool,
    pub cache_deposit: Option<String>,

    /// Resolved shell command; `None` for rules whose outputs appear by
    /// other means
    pub command: Option<String>,
}

impl Rule {
    /// Minimal rule, mostly useful in tests
    pub fn new(id: &str, inputs: &[&str], outputs: &[&str], spec_hash: &str) -> Self {
        Self {
            id: id.to_string(),
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            spec_hash: spec_hash.to_string(),
            cacheable: false,
            cache_deposit: None,
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

impl RuleRecord {
    /// Resolve the command and append script and declared dependencies
    pub fn resolve(&self, config: &Config) -> ManuResult<Rule> {
        let mut inputs = self.inputs.clone();

        let command = match (&self.command, &self.script) {
            (Some(command), _) => Some(command.clone()),
            (None, Some(script)) => {
                if !inputs.contains(script) {
                    inputs.push(script.clone());
                }
                Some(script_command(script, config)?)
            }
            (None, None) => None,
        };

        let mut extra = BTreeSet::new();
        for input in &inputs {
            extra.extend(upstream_dependencies(input, &config.dependencies));
        }
        for dep in extra {
            if !inputs.contains(&dep) {
                inputs.push(dep);
            }
        }

        Ok(Rule {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
            spec_hash: self.spec_hash.clone(),
            cacheable: self.cacheable,
            cache_deposit: self.cache_deposit.clone(),
            command,
        })
    }
}

fn script_command(script: &Path, config: &Config) -> ManuResult<String> {
    let extension = script
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let template = config.scripts.template(extension).ok_or_else(|| {
        ManuError::User(format!(
            "no command template for .{} scripts ({}); add one under [scripts]",
            extension,
            script.display()
        ))
    })?;
    Ok(template.replace("{script}", &script.to_string_lossy()))
}

/// Every file `file` depends on through `[dependencies]`, transitively
pub fn upstream_dependencies(
    file: &Path,
    dependencies: &BTreeMap<PathBuf, Vec<PathBuf>>,
) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let mut stack = vec![file.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Some(deps) = dependencies.get(&current) else {
            continue;
        };
        for dep in deps {
            if dep != file && found.insert(dep.clone()) {
                stack.push(dep.clone());
            }
        }
    }
    found
}

/// Read rule records from a JSON file
pub async fn load_rules(path: &Path) -> ManuResult<Vec<RuleRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ManuError::io(format!("reading rules from {}", path.display()), e))?;
    let records: Vec<RuleRecord> = serde_json::from_str(&content)?;
    debug!("Loaded {} rules from {}", records.len(), path.display());
    Ok(records)
}
