//! Plan command - show what a build would do

use crate::cli::args::PlanArgs;
use crate::cli::commands::open_engine;
use crate::config::Config;
use crate::engine::{BuildFlags, Engine};
use crate::error::ManuResult;
use crate::ui::{self, UiContext};
use std::path::Path;

/// Execute the plan command
pub async fn execute(args: PlanArgs, config: &Config, root: &Path) -> ManuResult<()> {
    let mut flags = BuildFlags::from_config(config);
    if args.optimize {
        flags.optimize = true;
    }
    // Missing dataset files are fine here; nothing is fetched
    let engine = open_engine(config, root, &args.rules.rules, flags).await?;
    let graph = engine.graph();

    if args.dot {
        print!("{}", graph.to_dot(|idx| graph.rule(idx).id.clone()));
        return Ok(());
    }

    let (eval, plan) = engine.plan().await?;
    let ctx = UiContext::detect();
    let width = graph.rules().iter().map(|r| r.id.len()).max().unwrap_or(0);

    ui::section(&ctx, "Plan");
    for &idx in &eval.order {
        let state = Engine::planned_state(&eval, &plan, idx);
        let mut detail = eval.rules[idx]
            .reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        if plan.restore.contains(&idx) {
            detail = "restore".to_string();
        }
        println!(
            "  {:<width$}  {}  {}",
            graph.rule(idx).id,
            ui::state_label(&ctx, state),
            detail,
            width = width
        );
    }

    println!();
    ui::remark(
        &ctx,
        &format!(
            "{} to run, {} to restore, {} pruned",
            plan.run.len(),
            plan.restore.len(),
            plan.pruned.len()
        ),
    );
    Ok(())
}
