//! Build engine
//!
//! A build runs in phases:
//!
//! 1. materialize datasets
//! 2. evaluate freshness of every rule
//! 3. plan restores and pruning
//! 4. restore and execute
//! 5. report
//!
//! Structural problems (cycles, missing inputs, a mandatory remote tier that
//! cannot be reached) end the build before anything runs. Rule failures are
//! recorded in the report instead.

pub mod context;
pub mod freshness;
pub mod prune;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use context::{BuildContext, BuildFlags};
pub use freshness::{evaluate, Evaluation, Freshness, StaleReason};
pub use prune::{plan, ExecutionPlan};
pub use report::{BuildReport, DatasetReport, RuleReport};
pub use runner::{RuleRunner, ShellRunner};
pub use scheduler::{execute, RuleOutcome};
pub use state::RuleState;

use crate::config::ConfigManager;
use crate::dataset::DatasetMaterializer;
use crate::error::ManuResult;
use crate::graph::RuleGraph;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// A rule graph bound to a build context
pub struct Engine {
    graph: Arc<RuleGraph>,
    ctx: Arc<BuildContext>,
    runner: Arc<dyn RuleRunner>,
    datasets: Option<Arc<DatasetMaterializer>>,
}

impl Engine {
    pub fn new(graph: RuleGraph, ctx: BuildContext, runner: Arc<dyn RuleRunner>) -> Self {
        Self {
            graph: Arc::new(graph),
            ctx: Arc::new(ctx),
            runner,
            datasets: None,
        }
    }

    /// Engine that materializes `datasets` before evaluating.
    ///
    /// Files the datasets declare are excused from the missing-input check:
    /// when a dataset cannot be fetched, only the rules reading it fail.
    pub fn with_datasets(
        graph: RuleGraph,
        mut ctx: BuildContext,
        runner: Arc<dyn RuleRunner>,
        datasets: Arc<DatasetMaterializer>,
    ) -> ManuResult<Self> {
        for id in datasets.ids() {
            ctx.excused_inputs.extend(datasets.declared_files(id)?);
        }
        let mut engine = Self::new(graph, ctx, runner);
        engine.datasets = Some(datasets);
        Ok(engine)
    }

    pub fn graph(&self) -> &RuleGraph {
        &self.graph
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// Evaluate and plan without running anything
    pub async fn plan(&self) -> ManuResult<(Evaluation, ExecutionPlan)> {
        let eval = evaluate(&self.graph, &self.ctx).await?;
        let plan = prune::plan(&self.graph, &eval, self.ctx.flags.optimize);
        Ok((eval, plan))
    }

    /// State a rule ends up in when `plan` is executed without failures
    pub fn planned_state(eval: &Evaluation, plan: &ExecutionPlan, idx: usize) -> RuleState {
        if plan.is_pruned(idx) {
            RuleState::Pruned
        } else {
            eval.state(idx)
        }
    }

    /// Run a full build
    pub async fn build(&self) -> ManuResult<BuildReport> {
        let started_at = Utc::now();

        let datasets = match &self.datasets {
            Some(materializer) => materializer
                .materialize_all()
                .await
                .into_iter()
                .map(|(id, result)| match result {
                    Ok(done) => DatasetReport {
                        id,
                        ok: true,
                        fetched: done.fetched,
                        error: None,
                    },
                    Err(e) => DatasetReport {
                        id,
                        ok: false,
                        fetched: 0,
                        error: Some(e.to_string()),
                    },
                })
                .collect(),
            None => Vec::new(),
        };

        let (eval, plan) = self.plan().await?;
        info!(
            "{} rules: {} to run, {} to restore, {} pruned",
            self.graph.len(),
            plan.run.len(),
            plan.restore.len(),
            plan.pruned.len()
        );

        let outcomes = execute(
            Arc::clone(&self.graph),
            Arc::clone(&self.ctx),
            Arc::clone(&self.runner),
            &eval,
            &plan,
        )
        .await;

        if let Err(e) = self
            .ctx
            .hasher
            .save(&ConfigManager::hash_memo_path(&self.ctx.root))
        {
            warn!("Could not save hash memo: {}", e);
        }

        let rules = eval
            .order
            .iter()
            .map(|&idx| {
                let outcome = &outcomes[idx];
                RuleReport {
                    id: self.graph.rule(idx).id.clone(),
                    state: outcome.state,
                    key: outcome.key.map(|k| k.to_hex()),
                    wall_time_ms: outcome.wall_time.as_millis() as u64,
                    reason: outcome.reason.clone(),
                    restored: outcome.restored,
                    uploaded: outcome.uploaded,
                }
            })
            .collect();

        Ok(BuildReport {
            started_at,
            finished_at: Utc::now(),
            datasets,
            rules,
        })
    }
}
