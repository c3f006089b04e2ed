//! Execution planning and pruning
//!
//! The plan runs every stale rule and decides, per cached rule, whether its
//! outputs must be restored:
//!
//! - without optimization every cached rule is restored;
//! - with optimization a cached rule is restored only when a stale rule
//!   reads it directly or it is a final target, and a cached rule with no
//!   stale rule anywhere downstream is pruned outright.
//!
//! Pruning works per rule, not per output file.

use crate::engine::freshness::Evaluation;
use crate::engine::state::RuleState;
use crate::graph::{RuleGraph, RuleIdx};

/// What the scheduler does with each rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Stale rules, in topological order
    pub run: Vec<RuleIdx>,

    /// Cached rules whose outputs are copied into the project
    pub restore: Vec<RuleIdx>,

    /// Cached rules dropped from the build entirely
    pub pruned: Vec<RuleIdx>,
}

impl ExecutionPlan {
    pub fn is_pruned(&self, idx: RuleIdx) -> bool {
        self.pruned.contains(&idx)
    }
}

/// For each rule, whether any transitive dependent is stale.
///
/// One pass in reverse topological order: linear in edges.
pub fn stale_downstream(graph: &RuleGraph, eval: &Evaluation) -> Vec<bool> {
    let mut flags = vec![false; graph.len()];
    for &idx in eval.order.iter().rev() {
        flags[idx] = graph
            .dependents(idx)
            .into_iter()
            .any(|d| eval.is_stale(d) || flags[d]);
    }
    flags
}

/// Build the execution plan
pub fn plan(graph: &RuleGraph, eval: &Evaluation, optimize: bool) -> ExecutionPlan {
    let downstream = stale_downstream(graph, eval);
    let mut plan = ExecutionPlan {
        run: Vec::new(),
        restore: Vec::new(),
        pruned: Vec::new(),
    };

    for &idx in &eval.order {
        match eval.state(idx) {
            RuleState::Stale => plan.run.push(idx),
            RuleState::Cached if !optimize => plan.restore.push(idx),
            RuleState::Cached => {
                let dependents = graph.dependents(idx);
                let is_target = dependents.is_empty();
                if !is_target && !downstream[idx] {
                    plan.pruned.push(idx);
                } else if is_target || dependents.iter().any(|&d| eval.is_stale(d)) {
                    plan.restore.push(idx);
                }
            }
            _ => {}
        }
    }

    plan
}
