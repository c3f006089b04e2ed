//! Freshness evaluation
//!
//! Rules are visited in topological order. A rule with a stale dependency
//! is stale without consulting the cache, so nothing downstream of a change
//! can be reported cached. Otherwise its key is derived from the input
//! digests (cached producers contribute the digests recorded in their
//! entries, without touching disk) and looked up.

use crate::cache::{CacheEntry, CacheKey, Digest, Lookup};
use crate::engine::context::BuildContext;
use crate::engine::state::RuleState;
use crate::error::{ManuError, ManuResult};
use crate::graph::{RuleGraph, RuleIdx};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Why a rule must run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No entry for the rule's key
    Miss,
    /// Named in the force set
    Forced,
    /// Caching is disabled
    CacheDisabled,
    /// A dependency is stale
    Upstream(String),
    /// A leaf input does not exist
    MissingInput(PathBuf),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => write!(f, "cache miss"),
            Self::Forced => write!(f, "forced"),
            Self::CacheDisabled => write!(f, "cache disabled"),
            Self::Upstream(dep) => write!(f, "depends on stale rule {}", dep),
            Self::MissingInput(path) => write!(f, "missing input {}", path.display()),
        }
    }
}

/// Decision for one rule
#[derive(Debug, Clone)]
pub struct Freshness {
    pub state: RuleState,

    /// Known when every input digest was available at evaluation time
    pub key: Option<CacheKey>,

    /// Entry backing a `CACHED` rule
    pub entry: Option<CacheEntry>,

    pub reason: Option<StaleReason>,
}

impl Freshness {
    fn stale(reason: StaleReason, key: Option<CacheKey>) -> Self {
        Self {
            state: RuleState::Stale,
            key,
            entry: None,
            reason: Some(reason),
        }
    }

    fn cached(entry: CacheEntry) -> Self {
        Self {
            state: RuleState::Cached,
            key: Some(entry.key()),
            entry: Some(entry),
            reason: None,
        }
    }
}

/// Freshness of every rule, indexed by rule
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub order: Vec<RuleIdx>,
    pub rules: Vec<Freshness>,
}

impl Evaluation {
    pub fn state(&self, idx: RuleIdx) -> RuleState {
        self.rules[idx].state
    }

    pub fn is_stale(&self, idx: RuleIdx) -> bool {
        self.rules[idx].state == RuleState::Stale
    }
}

/// Evaluate every rule of `graph`.
///
/// Fails on cycles, on missing leaf inputs when inputs are required, and on
/// remote failures when the remote tier is mandatory.
pub async fn evaluate(graph: &RuleGraph, ctx: &BuildContext) -> ManuResult<Evaluation> {
    let order = graph.topological_order()?;
    let mut rules: Vec<Option<Freshness>> = vec![None; graph.len()];

    for &idx in &order {
        let decision = evaluate_rule(graph, ctx, idx, &rules).await?;
        debug!(
            "{}: {}{}",
            graph.rule(idx).id,
            decision.state,
            decision
                .reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        rules[idx] = Some(decision);
    }

    let rules = rules
        .into_iter()
        .map(|f| f.ok_or_else(|| ManuError::Internal("rule left unevaluated".to_string())))
        .collect::<ManuResult<Vec<_>>>()?;
    Ok(Evaluation { order, rules })
}

async fn evaluate_rule(
    graph: &RuleGraph,
    ctx: &BuildContext,
    idx: RuleIdx,
    done: &[Option<Freshness>],
) -> ManuResult<Freshness> {
    let rule = graph.rule(idx);

    // Leaf inputs are checked first so missing files surface even when the
    // rule would be stale anyway
    let mut missing = None;
    for input in graph.leaf_inputs(idx) {
        if !ctx.resolve(input).is_file() {
            if ctx.flags.require_inputs && !ctx.excused_inputs.contains(&ctx.resolve(input)) {
                return Err(ManuError::MissingInput {
                    rule: rule.id.clone(),
                    path: input.to_path_buf(),
                });
            }
            missing.get_or_insert_with(|| input.to_path_buf());
        }
    }

    for dep in graph.dependencies(idx) {
        let stale = done[dep]
            .as_ref()
            .map(|f| f.state == RuleState::Stale)
            .unwrap_or(true);
        if stale {
            return Ok(Freshness::stale(
                StaleReason::Upstream(graph.rule(dep).id.clone()),
                None,
            ));
        }
    }

    if let Some(path) = missing {
        return Ok(Freshness::stale(StaleReason::MissingInput(path), None));
    }

    let mut digests: Vec<Digest> = Vec::with_capacity(rule.inputs.len());
    for input in &rule.inputs {
        let digest = match graph.producer_of(input) {
            Some(producer) => {
                let entry = done[producer].as_ref().and_then(|f| f.entry.as_ref());
                match entry.and_then(|e| e.meta.digest_of(input)) {
                    Some(digest) => digest,
                    None => {
                        return Err(ManuError::CacheCorrupt {
                            key: entry.map(|e| e.key().to_hex()).unwrap_or_default(),
                            reason: format!(
                                "entry of {} does not record {}",
                                graph.rule(producer).id,
                                input.display()
                            ),
                        })
                    }
                }
            }
            None => ctx.hasher.hash_file(&ctx.resolve(input))?,
        };
        digests.push(digest);
    }
    let key = CacheKey::derive(&rule.spec_hash, &digests);

    if !ctx.flags.cache_enabled {
        return Ok(Freshness::stale(StaleReason::CacheDisabled, Some(key)));
    }
    if ctx.is_forced(rule) {
        return Ok(Freshness::stale(StaleReason::Forced, Some(key)));
    }

    let deposit = ctx.deposit_for(rule);
    match ctx.store.get(&key, deposit.as_deref()).await? {
        Lookup::Hit(entry) => Ok(Freshness::cached(entry)),
        Lookup::Miss => Ok(Freshness::stale(StaleReason::Miss, Some(key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, CachedOutput, ContentHasher, EntryMeta, LocalStore};
    use crate::engine::context::BuildFlags;
    use crate::graph::Rule;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(root: &Path, flags: BuildFlags) -> BuildContext {
        BuildContext::new(
            root,
            CacheStore::new(LocalStore::new(root.join(".cache"))),
            Arc::new(ContentHasher::new()),
            flags,
        )
    }

    /// Seed the cache as if `rule` had run with its current inputs
    fn seed(ctx: &BuildContext, key: CacheKey, rule: &Rule, data: &[u8]) {
        let mut outputs = Vec::new();
        let mut sources = Vec::new();
        for out in &rule.outputs {
            let path = ctx.root.join(".seed").join(out);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, data).unwrap();
            outputs.push(CachedOutput {
                path: out.clone(),
                digest: Digest::of(data),
                size: data.len() as u64,
            });
            sources.push(path);
        }
        ctx.store
            .put(&EntryMeta::new(key, &rule.id, outputs), &sources)
            .unwrap();
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"x").unwrap();
        let graph = RuleGraph::from_rules([Rule::new("a", &["in.txt"], &["a.out"], "h")]).unwrap();
        let ctx = ctx(dir.path(), BuildFlags::default());

        let first = evaluate(&graph, &ctx).await.unwrap();
        assert_eq!(first.state(0), RuleState::Stale);
        assert_eq!(first.rules[0].reason, Some(StaleReason::Miss));
        let key = first.rules[0].key.unwrap();

        seed(&ctx, key, graph.rule(0), b"out");
        let second = evaluate(&graph, &ctx).await.unwrap();
        assert_eq!(second.state(0), RuleState::Cached);
        assert_eq!(second.rules[0].key, Some(key));
    }

    #[tokio::test]
    async fn stale_dependency_makes_rule_stale() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"x").unwrap();
        let graph = RuleGraph::from_rules([
            Rule::new("a", &["in.txt"], &["a.out"], "ha"),
            Rule::new("b", &["a.out"], &["b.out"], "hb"),
        ])
        .unwrap();
        let ctx = ctx(dir.path(), BuildFlags::default());

        let eval = evaluate(&graph, &ctx).await.unwrap();
        assert_eq!(eval.state(1), RuleState::Stale);
        assert_eq!(eval.rules[1].reason, Some(StaleReason::Upstream("a".to_string())));
        assert_eq!(eval.rules[1].key, None);
    }

    #[tokio::test]
    async fn cached_producer_digest_comes_from_metadata() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"x").unwrap();
        let graph = RuleGraph::from_rules([
            Rule::new("a", &["in.txt"], &["a.out"], "ha"),
            Rule::new("b", &["a.out"], &["b.out"], "hb"),
        ])
        .unwrap();
        let ctx = ctx(dir.path(), BuildFlags::default());

        let key_a = evaluate(&graph, &ctx).await.unwrap().rules[0].key.unwrap();
        seed(&ctx, key_a, graph.rule(0), b"A");

        // a.out is not on disk; b's key still derives from the recorded digest
        let eval = evaluate(&graph, &ctx).await.unwrap();
        assert_eq!(eval.state(0), RuleState::Cached);
        assert_eq!(
            eval.rules[1].key,
            Some(CacheKey::derive("hb", &[Digest::of(b"A")]))
        );
        assert!(!dir.path().join("a.out").exists());
    }

    #[tokio::test]
    async fn force_and_disabled_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"x").unwrap();
        let graph = RuleGraph::from_rules([Rule::new("a", &["in.txt"], &["a.out"], "h")]).unwrap();

        let plain = ctx(dir.path(), BuildFlags::default());
        let key = evaluate(&graph, &plain).await.unwrap().rules[0].key.unwrap();
        seed(&plain, key, graph.rule(0), b"out");

        let mut flags = BuildFlags::default();
        flags.force.insert("a".to_string());
        let forced = evaluate(&graph, &ctx(dir.path(), flags)).await.unwrap();
        assert_eq!(forced.rules[0].reason, Some(StaleReason::Forced));

        let flags = BuildFlags {
            cache_enabled: false,
            ..BuildFlags::default()
        };
        let disabled = evaluate(&graph, &ctx(dir.path(), flags)).await.unwrap();
        assert_eq!(disabled.rules[0].reason, Some(StaleReason::CacheDisabled));
    }

    #[tokio::test]
    async fn missing_leaf_input() {
        let dir = TempDir::new().unwrap();
        let graph =
            RuleGraph::from_rules([Rule::new("a", &["absent.csv"], &["a.out"], "h")]).unwrap();

        let strict = ctx(dir.path(), BuildFlags::default());
        assert!(matches!(
            evaluate(&graph, &strict).await,
            Err(ManuError::MissingInput { .. })
        ));

        let lenient = ctx(
            dir.path(),
            BuildFlags {
                require_inputs: false,
                ..BuildFlags::default()
            },
        );
        let eval = evaluate(&graph, &lenient).await.unwrap();
        assert_eq!(
            eval.rules[0].reason,
            Some(StaleReason::MissingInput(PathBuf::from("absent.csv")))
        );

        let mut excused = ctx(dir.path(), BuildFlags::default());
        excused.excused_inputs.insert(dir.path().join("absent.csv"));
        assert!(evaluate(&graph, &excused).await.unwrap().is_stale(0));
    }
}
