//! Machine-readable execution report

use crate::engine::state::RuleState;
use crate::error::{ManuError, ManuResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Final record for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleReport {
    pub id: String,
    pub state: RuleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub wall_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub restored: bool,
    #[serde(default)]
    pub uploaded: bool,
}

/// Outcome of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetReport {
    pub id: String,
    pub ok: bool,
    pub fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Report of a whole build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub datasets: Vec<DatasetReport>,
    /// Rules in topological order
    pub rules: Vec<RuleReport>,
}

impl BuildReport {
    /// Number of rules in each state
    pub fn summary(&self) -> BTreeMap<RuleState, usize> {
        let mut counts = BTreeMap::new();
        for rule in &self.rules {
            *counts.entry(rule.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, state: RuleState) -> usize {
        self.rules.iter().filter(|r| r.state == state).count()
    }

    pub fn rule(&self, id: &str) -> Option<&RuleReport> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// True when no rule failed or was blocked
    pub fn success(&self) -> bool {
        !self.rules.iter().any(|r| r.state.is_failure())
    }

    /// Process exit status for this build
    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Write the report as pretty JSON
    pub async fn write(&self, path: &Path) -> ManuResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| ManuError::io(format!("writing report {}", path.display()), e))?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(id: &str, state: RuleState) -> RuleReport {
        RuleReport {
            id: id.to_string(),
            state,
            key: None,
            wall_time_ms: 0,
            reason: None,
            restored: false,
            uploaded: false,
        }
    }

    fn report(rules: Vec<RuleReport>) -> BuildReport {
        let now = Utc::now();
        BuildReport {
            started_at: now,
            finished_at: now,
            datasets: vec![],
            rules,
        }
    }

    #[test]
    fn exit_code_reflects_failures() {
        let ok = report(vec![rule("a", RuleState::Cached), rule("b", RuleState::Done)]);
        assert!(ok.success());
        assert_eq!(ok.exit_code(), 0);

        let blocked = report(vec![rule("a", RuleState::Done), rule("b", RuleState::Blocked)]);
        assert_eq!(blocked.exit_code(), 1);
    }

    #[test]
    fn summary_counts_states() {
        let r = report(vec![
            rule("a", RuleState::Cached),
            rule("b", RuleState::Cached),
            rule("c", RuleState::Failed),
        ]);
        let summary = r.summary();
        assert_eq!(summary[&RuleState::Cached], 2);
        assert_eq!(summary[&RuleState::Failed], 1);
        assert_eq!(r.count(RuleState::Done), 0);
    }

    #[tokio::test]
    async fn writes_camel_case_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("report.json");
        let mut r = report(vec![rule("fig1", RuleState::Done)]);
        r.rules[0].key = Some("abc".to_string());
        r.rules[0].wall_time_ms = 42;

        r.write(&path).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["rules"][0]["state"], "DONE");
        assert_eq!(json["rules"][0]["wallTimeMs"], 42);
        assert_eq!(json["rules"][0]["key"], "abc");
        assert!(json["rules"][0].get("reason").is_none());
    }
}
