//! Execution scheduler
//!
//! Restores cached outputs the plan asks for, then runs stale rules on a
//! bounded worker pool. A rule starts once every stale dependency is
//! `DONE`; among ready rules the earliest in topological order goes first.
//! A failure blocks the failed rule's descendants and nothing else.
//!
//! A restore that fails because an optional remote is unreachable turns
//! the rule back to `STALE` and runs it like any other stale rule.

use crate::cache::{CacheKey, CachedOutput, Digest, EntryMeta, Tier};
use crate::engine::context::BuildContext;
use crate::engine::freshness::Evaluation;
use crate::engine::prune::ExecutionPlan;
use crate::engine::runner::RuleRunner;
use crate::engine::state::RuleState;
use crate::error::{ManuError, ManuResult};
use crate::graph::{RuleGraph, RuleIdx};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Final outcome of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub state: RuleState,
    pub key: Option<CacheKey>,
    pub wall_time: Duration,
    pub reason: Option<String>,
    pub restored: bool,
    pub uploaded: bool,
}

impl RuleOutcome {
    fn transition(&mut self, next: RuleState) {
        if !self.state.can_become(next) {
            warn!("Unexpected transition {} -> {}", self.state, next);
        }
        self.state = next;
    }

    fn fail(&mut self, reason: String) {
        self.transition(RuleState::Failed);
        self.reason = Some(reason);
    }
}

struct Completed {
    idx: RuleIdx,
    result: ManuResult<(CacheKey, bool)>,
    wall_time: Duration,
}

/// Run `plan` to completion. Never fails as a whole: rule failures are
/// recorded in the outcomes.
pub async fn execute(
    graph: Arc<RuleGraph>,
    ctx: Arc<BuildContext>,
    runner: Arc<dyn RuleRunner>,
    eval: &Evaluation,
    plan: &ExecutionPlan,
) -> Vec<RuleOutcome> {
    let mut outcomes: Vec<RuleOutcome> = eval
        .rules
        .iter()
        .map(|f| RuleOutcome {
            state: f.state,
            key: f.key,
            wall_time: Duration::ZERO,
            reason: f.reason.as_ref().map(|r| r.to_string()),
            restored: false,
            uploaded: false,
        })
        .collect();

    publish_local_hits(&graph, &ctx, eval, &mut outcomes).await;

    let mut run = plan.run.clone();
    let mut visited = vec![false; graph.len()];
    let mut queue: VecDeque<RuleIdx> = plan.restore.iter().copied().collect();
    while let Some(idx) = queue.pop_front() {
        let seen = std::mem::replace(&mut visited[idx], true);
        if seen || outcomes[idx].state != RuleState::Cached {
            continue;
        }
        let id = &graph.rule(idx).id;
        let started = Instant::now();
        let result = restore_rule(&graph, &ctx, eval, idx).await;
        outcomes[idx].wall_time = started.elapsed();
        match result {
            Ok(copied) => outcomes[idx].restored = copied,
            Err(e) if ctx.store.can_recompute_after(&e) => {
                warn!("Restoring {} failed, running it instead: {}", id, e);
                outcomes[idx].transition(RuleState::Stale);
                outcomes[idx].reason = Some(format!("restore failed: {}", e));

                let dependencies = graph.dependencies(idx);
                let failed_dependency = dependencies
                    .iter()
                    .copied()
                    .find(|&d| outcomes[d].state.is_failure());
                if let Some(failed) = failed_dependency {
                    block_descendants(&graph, &mut outcomes, failed);
                    continue;
                }
                run.push(idx);
                // Its cached inputs have to be on disk now, pruned or not
                queue.extend(
                    dependencies
                        .into_iter()
                        .filter(|&d| !visited[d] && outcomes[d].state == RuleState::Cached),
                );
            }
            Err(e) => {
                error!("Restoring {} failed: {}", id, e);
                outcomes[idx].fail(e.to_string());
                block_descendants(&graph, &mut outcomes, idx);
            }
        }
    }

    for &idx in &plan.pruned {
        if !visited[idx] && outcomes[idx].state == RuleState::Cached {
            outcomes[idx].transition(RuleState::Pruned);
        }
    }

    run_stale(graph, ctx, runner, eval, &run, &mut outcomes).await;
    outcomes
}

/// Upload cached entries that only the local tier holds, e.g. after an
/// upload failed in an earlier build
async fn publish_local_hits(
    graph: &RuleGraph,
    ctx: &BuildContext,
    eval: &Evaluation,
    outcomes: &mut [RuleOutcome],
) {
    for &idx in &eval.order {
        let rule = graph.rule(idx);
        let entry = eval.rules[idx].entry.as_ref();
        let (Some(entry), Some(deposit)) = (entry, ctx.deposit_for(rule)) else {
            continue;
        };
        if entry.tier != Tier::Local || outcomes[idx].state != RuleState::Cached {
            continue;
        }
        match ctx.store.publish(&entry.key(), &deposit).await {
            Ok(uploaded) => outcomes[idx].uploaded = uploaded,
            Err(e) => {
                error!("Uploading {} failed: {}", rule.id, e);
                outcomes[idx].fail(e.to_string());
                block_descendants(graph, outcomes, idx);
            }
        }
    }
}

async fn run_stale(
    graph: Arc<RuleGraph>,
    ctx: Arc<BuildContext>,
    runner: Arc<dyn RuleRunner>,
    eval: &Evaluation,
    run: &[RuleIdx],
    outcomes: &mut [RuleOutcome],
) {
    let n = graph.len();
    let mut position = vec![0usize; n];
    for (pos, &idx) in eval.order.iter().enumerate() {
        position[idx] = pos;
    }
    let mut in_run = vec![false; n];
    for &idx in run {
        in_run[idx] = true;
    }

    let mut remaining: Vec<usize> = (0..n)
        .map(|idx| {
            graph
                .dependencies(idx)
                .into_iter()
                .filter(|&d| in_run[d])
                .count()
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, RuleIdx)>> = run
        .iter()
        .filter(|&&idx| remaining[idx] == 0)
        .map(|&idx| Reverse((position[idx], idx)))
        .collect();

    let semaphore = Arc::new(Semaphore::new(ctx.flags.jobs.max(1)));
    let mut set: JoinSet<Completed> = JoinSet::new();

    loop {
        while let Some(&Reverse((_, idx))) = ready.peek() {
            if outcomes[idx].state != RuleState::Stale {
                ready.pop();
                continue;
            }
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            ready.pop();
            outcomes[idx].transition(RuleState::Running);

            let graph = Arc::clone(&graph);
            let ctx = Arc::clone(&ctx);
            let runner = Arc::clone(&runner);
            let known_key = outcomes[idx].key;
            set.spawn(async move {
                let started = Instant::now();
                let result = run_rule(graph, ctx, runner.as_ref(), idx, known_key).await;
                drop(permit);
                Completed {
                    idx,
                    result,
                    wall_time: started.elapsed(),
                }
            });
        }

        let Some(joined) = set.join_next().await else {
            break;
        };
        let done = match joined {
            Ok(done) => done,
            Err(e) => {
                error!("Rule task aborted: {}", e);
                continue;
            }
        };

        let id = &graph.rule(done.idx).id;
        outcomes[done.idx].wall_time = done.wall_time;
        match done.result {
            Ok((key, uploaded)) => {
                info!("{} done in {:.1}s", id, done.wall_time.as_secs_f64());
                let outcome = &mut outcomes[done.idx];
                outcome.transition(RuleState::Done);
                outcome.key = Some(key);
                outcome.uploaded = uploaded;
                outcome.reason = None;

                for dependent in graph.dependents(done.idx) {
                    if !in_run[dependent] {
                        continue;
                    }
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        ready.push(Reverse((position[dependent], dependent)));
                    }
                }
            }
            Err(e) => {
                error!("{} failed: {}", id, e);
                outcomes[done.idx].fail(e.to_string());
                block_descendants(&graph, outcomes, done.idx);
            }
        }
    }

    for (idx, outcome) in outcomes.iter_mut().enumerate() {
        match outcome.state {
            RuleState::Running => outcome.fail("rule task aborted".to_string()),
            RuleState::Stale => {
                debug!("{} never became ready", graph.rule(idx).id);
                outcome.transition(RuleState::Blocked);
            }
            _ => {}
        }
    }
}

fn block_descendants(graph: &RuleGraph, outcomes: &mut [RuleOutcome], failed: RuleIdx) {
    let failed_id = &graph.rule(failed).id;
    for idx in graph.descendants(failed) {
        if outcomes[idx].state == RuleState::Stale {
            outcomes[idx].transition(RuleState::Blocked);
            outcomes[idx].reason = Some(format!("blocked by {}", failed_id));
        }
    }
}

/// Copy a cached rule's outputs into the project unless they are already
/// there. Returns whether anything was copied.
async fn restore_rule(
    graph: &RuleGraph,
    ctx: &BuildContext,
    eval: &Evaluation,
    idx: RuleIdx,
) -> ManuResult<bool> {
    let entry = eval.rules[idx].entry.as_ref().ok_or_else(|| {
        ManuError::Internal(format!("{} is cached without an entry", graph.rule(idx).id))
    })?;

    let present = entry.meta.outputs.iter().all(|output| {
        let path = ctx.resolve(&output.path);
        path.is_file()
            && ctx
                .hasher
                .hash_file(&path)
                .map(|d| d == output.digest)
                .unwrap_or(false)
    });
    if present {
        debug!("Outputs of {} already in place", graph.rule(idx).id);
        return Ok(false);
    }

    ctx.store.restore(entry, &ctx.root).await?;
    for output in &entry.meta.outputs {
        ctx.hasher.invalidate(&ctx.resolve(&output.path));
    }
    info!("Restored {} from cache ({})", graph.rule(idx).id, entry.tier);
    Ok(true)
}

/// Run blocking file work on the blocking pool
async fn blocking<T, F>(what: &str, f: F) -> ManuResult<T>
where
    F: FnOnce() -> ManuResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ManuError::Internal(format!("{} panicked: {}", what, e)))?
}

/// Run one stale rule and store its outputs. Returns the rule's key and
/// whether the entry was uploaded.
async fn run_rule(
    graph: Arc<RuleGraph>,
    ctx: Arc<BuildContext>,
    runner: &dyn RuleRunner,
    idx: RuleIdx,
    known_key: Option<CacheKey>,
) -> ManuResult<(CacheKey, bool)> {
    let rule = graph.rule(idx);

    if !ctx.may_recompute(rule) {
        return Err(ManuError::RemoteCacheRequired {
            rule: rule.id.clone(),
        });
    }
    for input in graph.leaf_inputs(idx) {
        if !ctx.resolve(input).is_file() {
            return Err(ManuError::MissingInput {
                rule: rule.id.clone(),
                path: input.to_path_buf(),
            });
        }
    }

    // Inputs produced upstream exist now; keys unknown at evaluation time
    // are derived from the files on disk
    let key = match known_key {
        Some(key) => key,
        None => {
            let (graph, ctx) = (Arc::clone(&graph), Arc::clone(&ctx));
            blocking("hashing inputs", move || input_key(&graph, &ctx, idx)).await?
        }
    };

    runner.run(rule, &ctx.root).await?;

    {
        let (graph, ctx) = (Arc::clone(&graph), Arc::clone(&ctx));
        blocking("storing outputs", move || store_outputs(&graph, &ctx, idx, key)).await?;
    }

    let uploaded = match ctx.deposit_for(rule).filter(|_| ctx.flags.cache_enabled) {
        Some(deposit) => ctx.store.upload(&key, &deposit).await?,
        None => false,
    };
    Ok((key, uploaded))
}

fn input_key(graph: &RuleGraph, ctx: &BuildContext, idx: RuleIdx) -> ManuResult<CacheKey> {
    let rule = graph.rule(idx);
    let digests = rule
        .inputs
        .iter()
        .map(|input| ctx.hasher.hash_file(&ctx.resolve(input)))
        .collect::<ManuResult<Vec<Digest>>>()?;
    Ok(CacheKey::derive(&rule.spec_hash, &digests))
}

/// Check and hash the declared outputs, then put them in the local tier
fn store_outputs(
    graph: &RuleGraph,
    ctx: &BuildContext,
    idx: RuleIdx,
    key: CacheKey,
) -> ManuResult<()> {
    let rule = graph.rule(idx);
    let mut outputs = Vec::with_capacity(rule.outputs.len());
    let mut sources = Vec::with_capacity(rule.outputs.len());
    for output in &rule.outputs {
        let path = ctx.resolve(output);
        if !path.is_file() {
            return Err(ManuError::rule_failed(
                &rule.id,
                format!("declared output {} was not produced", output.display()),
            ));
        }
        ctx.hasher.invalidate(&path);
        let digest = ctx.hasher.hash_file(&path)?;
        let size = std::fs::metadata(&path)
            .map_err(|e| ManuError::io(format!("reading metadata of {}", path.display()), e))?
            .len();
        outputs.push(CachedOutput {
            path: output.clone(),
            digest,
            size,
        });
        sources.push(path);
    }

    if ctx.flags.cache_enabled {
        ctx.store
            .put(&EntryMeta::new(key, &rule.id, outputs), &sources)?;
    }
    Ok(())
}
