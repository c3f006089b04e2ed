//! Build command - bring every rule up to date

use crate::cli::args::{BuildArgs, OutputFormat};
use crate::cli::commands::open_engine;
use crate::config::Config;
use crate::engine::{BuildFlags, BuildReport, RuleState};
use crate::error::ManuResult;
use crate::ui::{self, UiContext};
use std::path::Path;

/// Execute the build command; returns the process exit status
pub async fn execute(args: BuildArgs, config: &Config, root: &Path) -> ManuResult<u8> {
    let mut flags = BuildFlags::from_config(config);
    if let Some(jobs) = args.jobs {
        flags.jobs = jobs.max(1);
    }
    flags.force.extend(args.force);
    if args.no_cache {
        flags.cache_enabled = false;
    }
    if args.optimize {
        flags.optimize = true;
    }

    let engine = open_engine(config, root, &args.rules.rules, flags).await?;
    let report = engine.build().await?;

    if let Some(path) = args.report.as_ref().or(config.build.report.as_ref()) {
        report.write(&root.join(path)).await?;
    }

    match args.format {
        OutputFormat::Table => print_report(&UiContext::detect(), &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(report.exit_code())
}

fn print_report(ctx: &UiContext, report: &BuildReport) {
    if !report.datasets.is_empty() {
        ui::section(ctx, "Datasets");
        for dataset in &report.datasets {
            match &dataset.error {
                None => ui::step_ok_detail(
                    ctx,
                    &dataset.id,
                    &format!("{} file(s) fetched", dataset.fetched),
                ),
                Some(e) => ui::step_error_detail(ctx, &dataset.id, e),
            }
        }
        let failed = report.datasets.iter().filter(|d| !d.ok).count();
        if failed > 0 {
            ui::step_warn(
                ctx,
                &format!("{} dataset(s) unavailable; rules reading them cannot run", failed),
            );
        }
    }

    ui::section(ctx, "Rules");
    let width = report.rules.iter().map(|r| r.id.len()).max().unwrap_or(0);
    for rule in &report.rules {
        let mut detail = Vec::new();
        if rule.restored {
            detail.push("restored".to_string());
        }
        if rule.uploaded {
            detail.push("uploaded".to_string());
        }
        if let Some(reason) = &rule.reason {
            detail.push(reason.lines().next().unwrap_or_default().to_string());
        }
        let time = if rule.state == RuleState::Done {
            format!("{:.1}s", rule.wall_time_ms as f64 / 1000.0)
        } else {
            String::new()
        };
        println!(
            "  {:<width$}  {} {:>7}  {}",
            rule.id,
            ui::state_label(ctx, rule.state),
            time,
            detail.join(", "),
            width = width
        );
    }

    let summary: Vec<String> = report
        .summary()
        .iter()
        .map(|(state, n)| format!("{} {}", n, state.as_str().to_lowercase()))
        .collect();
    println!();
    let line = format!(
        "{} in {:.1}s",
        summary.join(", "),
        report.duration_ms() as f64 / 1000.0
    );
    if report.success() {
        ui::step_ok(ctx, &line);
    } else {
        ui::step_error(ctx, &line);
    }
}
