//! Rule dependency graph
//!
//! Nodes are rules, indexed in declaration order. An edge `p -> c` means
//! rule `c` reads a file that rule `p` writes. Rules can be added in any
//! order: edges to a producer declared later are filled in when it arrives.

use crate::error::{ManuError, ManuResult};
use crate::graph::rule::Rule;
use petgraph::algo::tarjan_scc;
use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

/// Position of a rule in declaration order
pub type RuleIdx = usize;

/// DAG of rules linked through the files they exchange
#[derive(Debug, Default)]
pub struct RuleGraph {
    graph: DiGraph<RuleIdx, ()>,
    rules: Vec<Rule>,
    by_id: HashMap<String, RuleIdx>,
    producers: HashMap<PathBuf, RuleIdx>,
    consumers: HashMap<PathBuf, Vec<RuleIdx>>,
}

impl RuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from rules in declaration order
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> ManuResult<Self> {
        let mut graph = Self::new();
        for rule in rules {
            graph.add_rule(rule)?;
        }
        Ok(graph)
    }

    /// Add a rule, linking it to known producers and consumers of its files
    pub fn add_rule(&mut self, rule: Rule) -> ManuResult<RuleIdx> {
        if self.by_id.contains_key(&rule.id) {
            return Err(ManuError::DuplicateRule(rule.id));
        }
        for output in &rule.outputs {
            if let Some(&first) = self.producers.get(output) {
                return Err(ManuError::DuplicateOutput {
                    path: output.clone(),
                    first: self.rules[first].id.clone(),
                    second: rule.id,
                });
            }
        }

        let idx = self.rules.len();
        let node = self.graph.add_node(idx);
        debug_assert_eq!(node.index(), idx);

        for output in &rule.outputs {
            self.producers.insert(output.clone(), idx);
            if let Some(readers) = self.consumers.get(output) {
                for &reader in readers {
                    self.graph
                        .update_edge(NodeIndex::new(idx), NodeIndex::new(reader), ());
                }
            }
        }
        for input in &rule.inputs {
            self.consumers.entry(input.clone()).or_default().push(idx);
            if let Some(&producer) = self.producers.get(input) {
                self.graph
                    .update_edge(NodeIndex::new(producer), NodeIndex::new(idx), ());
            }
        }

        self.by_id.insert(rule.id.clone(), idx);
        self.rules.push(rule);
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, idx: RuleIdx) -> &Rule {
        &self.rules[idx]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Index of a rule id
    pub fn index_of(&self, id: &str) -> ManuResult<RuleIdx> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| ManuError::UnknownRule(id.to_string()))
    }

    /// Rule writing `path`, if any
    pub fn producer_of(&self, path: &Path) -> Option<RuleIdx> {
        self.producers.get(path).copied()
    }

    /// Rules whose outputs `idx` reads, in declaration order
    pub fn dependencies(&self, idx: RuleIdx) -> Vec<RuleIdx> {
        self.neighbors(idx, Direction::Incoming)
    }

    /// Rules reading an output of `idx`, in declaration order
    pub fn dependents(&self, idx: RuleIdx) -> Vec<RuleIdx> {
        self.neighbors(idx, Direction::Outgoing)
    }

    fn neighbors(&self, idx: RuleIdx, dir: Direction) -> Vec<RuleIdx> {
        let mut found: Vec<RuleIdx> = self
            .graph
            .neighbors_directed(NodeIndex::new(idx), dir)
            .map(|n| n.index())
            .filter(|&n| n != idx)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Rules nothing else reads from: the final targets
    pub fn targets(&self) -> Vec<RuleIdx> {
        (0..self.len())
            .filter(|&idx| self.dependents(idx).is_empty())
            .collect()
    }

    /// Inputs of `idx` that no rule produces
    pub fn leaf_inputs(&self, idx: RuleIdx) -> Vec<&Path> {
        self.rules[idx]
            .inputs
            .iter()
            .filter(|input| !self.producers.contains_key(*input))
            .map(PathBuf::as_path)
            .collect()
    }

    /// Topological order, ties broken by declaration order.
    ///
    /// Fails with `Cycle` naming the rules on one cycle.
    pub fn topological_order(&self) -> ManuResult<Vec<RuleIdx>> {
        let n = self.len();
        let mut indegree = vec![0usize; n];
        for edge in self.graph.raw_edges() {
            indegree[edge.target().index()] += 1;
        }

        let mut ready: BinaryHeap<Reverse<RuleIdx>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for next in self.graph.neighbors(NodeIndex::new(idx)) {
                let next = next.index();
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < n {
            return Err(ManuError::Cycle {
                rules: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// One cycle as a closed path of rule ids, starting at its earliest rule
    fn find_cycle(&self) -> Vec<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .min_by_key(|scc| scc.iter().map(|n| n.index()).min());
        let Some(component) = component else {
            return Vec::new();
        };
        let members: BTreeSet<RuleIdx> = component.iter().map(|n| n.index()).collect();
        let Some(&start) = members.iter().next() else {
            return Vec::new();
        };

        // Walk inside the component until a rule repeats
        let mut path = vec![start];
        let mut current = start;
        loop {
            let next = self
                .graph
                .neighbors(NodeIndex::new(current))
                .map(|n| n.index())
                .filter(|n| members.contains(n))
                .min();
            let Some(next) = next else { break };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.rules[i].id.clone()).collect();
                cycle.push(self.rules[next].id.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }
        members.iter().map(|&i| self.rules[i].id.clone()).collect()
    }

    /// Every rule `idx` transitively depends on
    pub fn ancestors(&self, idx: RuleIdx) -> BTreeSet<RuleIdx> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(idx));
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node.index() != idx {
                found.insert(node.index());
            }
        }
        found
    }

    /// Every rule transitively depending on `idx`
    pub fn descendants(&self, idx: RuleIdx) -> BTreeSet<RuleIdx> {
        let mut dfs = Dfs::new(&self.graph, NodeIndex::new(idx));
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node.index() != idx {
                found.insert(node.index());
            }
        }
        found
    }

    /// Ids of every rule `id` transitively depends on
    pub fn ancestors_of(&self, id: &str) -> ManuResult<BTreeSet<String>> {
        let idx = self.index_of(id)?;
        Ok(self
            .ancestors(idx)
            .into_iter()
            .map(|i| self.rules[i].id.clone())
            .collect())
    }

    /// Graphviz rendering, labelling each rule with `label(idx)`
    pub fn to_dot(&self, label: impl Fn(RuleIdx) -> String) -> String {
        let labelled = self.graph.map(|_, &idx| label(idx), |_, _| "");
        format!("{}", Dot::with_config(&labelled, &[DotConfig::EdgeNoLabel]))
    }
}
