//! Property tests over random rule graphs
//!
//! Rule `i` reads its own leaf file `in{i}.txt` plus the outputs of a random
//! subset of earlier rules, and writes `out{i}.txt`. A recording runner
//! derives each output from the rule id and its inputs, and fails when an
//! input is missing, so a build that forgets to restore something fails.

use async_trait::async_trait;
use manubuild::cache::{CacheStore, ContentHasher, LocalStore};
use manubuild::engine::{BuildContext, BuildFlags, BuildReport, Engine, RuleRunner, RuleState};
use manubuild::error::{ManuError, ManuResult};
use manubuild::graph::{Rule, RuleGraph};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingRunner {
    runs: Mutex<BTreeSet<String>>,
}

impl RecordingRunner {
    fn runs(&self) -> BTreeSet<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleRunner for RecordingRunner {
    async fn run(&self, rule: &Rule, root: &Path) -> ManuResult<()> {
        self.runs.lock().unwrap().insert(rule.id.clone());
        let mut content = rule.id.clone();
        for input in &rule.inputs {
            let text = std::fs::read_to_string(root.join(input))
                .map_err(|e| ManuError::io(format!("reading {}", input.display()), e))?;
            content.push('|');
            content.push_str(&text);
        }
        for output in &rule.outputs {
            std::fs::write(root.join(output), &content)
                .map_err(|e| ManuError::io(format!("writing {}", output.display()), e))?;
        }
        Ok(())
    }
}

/// Random DAG: rule count and, for every pair j < i, whether i reads j
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<bool>, usize)> {
    (2usize..8).prop_flat_map(|n| {
        (
            Just(n),
            proptest::collection::vec(any::<bool>(), n * (n - 1) / 2),
            0..n,
        )
    })
}

fn build_graph(n: usize, edges: &[bool]) -> RuleGraph {
    let mut rules = Vec::with_capacity(n);
    let mut bit = 0;
    for i in 0..n {
        let mut inputs = vec![format!("in{i}.txt")];
        for j in 0..i {
            if edges[bit] {
                inputs.push(format!("out{j}.txt"));
            }
            bit += 1;
        }
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let output = format!("out{i}.txt");
        rules.push(Rule::new(
            &format!("r{i}"),
            &inputs,
            &[output.as_str()],
            &format!("spec{i}"),
        ));
    }
    RuleGraph::from_rules(rules).unwrap()
}

fn seed_leaves(root: &Path, n: usize) {
    for i in 0..n {
        std::fs::write(root.join(format!("in{i}.txt")), format!("leaf {i}")).unwrap();
    }
}

fn engine(root: &Path, graph: RuleGraph, flags: BuildFlags, runner: Arc<RecordingRunner>) -> Engine {
    let ctx = BuildContext::new(
        root,
        CacheStore::new(LocalStore::new(root.join(".cache"))),
        Arc::new(ContentHasher::new()),
        flags,
    );
    Engine::new(graph, ctx, runner)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn full_build(root: &Path, graph: RuleGraph) -> BuildReport {
    let report = block_on(
        engine(root, graph, BuildFlags::default(), Arc::new(RecordingRunner::default())).build(),
    )
    .unwrap();
    assert!(report.success());
    report
}

fn ids(graph: &RuleGraph, idxs: impl IntoIterator<Item = usize>) -> BTreeSet<String> {
    idxs.into_iter().map(|i| graph.rule(i).id.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Unchanged inputs give identical keys and nothing stale
    #[test]
    fn keys_are_deterministic((n, edges, _k) in dag_strategy()) {
        let dir = TempDir::new().unwrap();
        seed_leaves(dir.path(), n);
        let report = full_build(dir.path(), build_graph(n, &edges));

        let again = engine(
            dir.path(),
            build_graph(n, &edges),
            BuildFlags::default(),
            Arc::new(RecordingRunner::default()),
        );
        let (eval, _) = block_on(again.plan()).unwrap();

        for (idx, rule) in again.graph().rules().iter().enumerate() {
            prop_assert_eq!(eval.state(idx), RuleState::Cached);
            let reported = report.rule(&rule.id).unwrap().key.clone();
            prop_assert_eq!(eval.rules[idx].key.map(|k| k.to_hex()), reported);
        }
    }

    /// Changing one leaf makes exactly that rule and its descendants stale
    #[test]
    fn invalidation_covers_exactly_the_descendants((n, edges, k) in dag_strategy()) {
        let dir = TempDir::new().unwrap();
        seed_leaves(dir.path(), n);
        full_build(dir.path(), build_graph(n, &edges));

        std::fs::write(dir.path().join(format!("in{k}.txt")), "edited leaf").unwrap();
        let after = engine(
            dir.path(),
            build_graph(n, &edges),
            BuildFlags::default(),
            Arc::new(RecordingRunner::default()),
        );
        let (eval, _) = block_on(after.plan()).unwrap();
        let graph = after.graph();

        let mut expected = graph.descendants(k);
        expected.insert(k);
        let stale: BTreeSet<usize> = (0..n).filter(|&i| eval.is_stale(i)).collect();
        prop_assert_eq!(ids(graph, stale), ids(graph, expected));
    }

    /// An optimized incremental build from an empty working tree runs only
    /// stale rules, still finds every input it needs, and ends with the same
    /// targets as a build from scratch
    #[test]
    fn pruned_builds_are_safe_and_minimal((n, edges, k) in dag_strategy()) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        seed_leaves(root, n);
        full_build(root, build_graph(n, &edges));

        std::fs::write(root.join(format!("in{k}.txt")), "edited leaf").unwrap();
        for i in 0..n {
            std::fs::remove_file(root.join(format!("out{i}.txt"))).unwrap();
        }

        let runner = Arc::new(RecordingRunner::default());
        let optimized = engine(
            root,
            build_graph(n, &edges),
            BuildFlags { optimize: true, ..BuildFlags::default() },
            runner.clone(),
        );
        let (eval, plan) = block_on(optimized.plan()).unwrap();
        let graph = optimized.graph();

        for idx in 0..n {
            let quiet_below = graph.descendants(idx).iter().all(|&d| !eval.is_stale(d));
            let prunable = !eval.is_stale(idx) && !graph.dependents(idx).is_empty() && quiet_below;
            prop_assert_eq!(plan.is_pruned(idx), prunable, "rule {}", idx);
        }

        let report = block_on(optimized.build()).unwrap();
        prop_assert!(report.success());
        let stale: BTreeSet<usize> = (0..n).filter(|&i| eval.is_stale(i)).collect();
        prop_assert_eq!(runner.runs(), ids(graph, stale));

        let reference = TempDir::new().unwrap();
        seed_leaves(reference.path(), n);
        std::fs::write(reference.path().join(format!("in{k}.txt")), "edited leaf").unwrap();
        full_build(reference.path(), build_graph(n, &edges));

        for idx in graph.targets() {
            let name = format!("out{idx}.txt");
            prop_assert_eq!(
                std::fs::read_to_string(root.join(&name)).unwrap(),
                std::fs::read_to_string(reference.path().join(&name)).unwrap()
            );
        }
    }
}
