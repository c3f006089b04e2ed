//! Rule graph model

pub mod dag;
pub mod rule;

pub use dag::{RuleGraph, RuleIdx};
pub use rule::{load_rules, upstream_dependencies, Rule, RuleRecord};

use crate::config::Config;
use crate::error::ManuResult;
use std::path::Path;

/// Load a rules file and build the graph, resolving commands and declared
/// dependencies against `config`
pub async fn load_graph(path: &Path, config: &Config) -> ManuResult<RuleGraph> {
    let records = load_rules(path).await?;
    let rules = records
        .iter()
        .map(|record| record.resolve(config))
        .collect::<ManuResult<Vec<_>>>()?;
    RuleGraph::from_rules(rules)
}
