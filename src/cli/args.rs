//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// manubuild - incremental builds for reproducible documents
///
/// Evaluates a graph of rules against a content-addressed cache and runs
/// only what changed.
#[derive(Parser, Debug)]
#[command(name = "manubuild")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MANUBUILD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local manubuild.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Materialize datasets, then build every stale rule
    Build(BuildArgs),

    /// Show what a build would do without running anything
    Plan(PlanArgs),

    /// Fetch all declared datasets
    Datasets,

    /// Remove rule outputs
    Clean(CleanArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Rules file shared by graph commands
#[derive(Parser, Debug)]
pub struct RulesArg {
    /// JSON file listing the rules
    #[arg(short, long, default_value = "rules.json")]
    pub rules: PathBuf,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub rules: RulesArg,

    /// Worker pool size (default: from config, else CPU count)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Rebuild a rule regardless of cache state (repeatable)
    #[arg(short, long = "force", value_name = "ID")]
    pub force: Vec<String>,

    /// Neither consult nor populate the cache
    #[arg(long)]
    pub no_cache: bool,

    /// Skip restoring cached rules that nothing stale needs
    #[arg(long)]
    pub optimize: bool,

    /// Write a JSON execution report
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// State table format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub rules: RulesArg,

    /// Print the rule graph in Graphviz DOT instead of states
    #[arg(long)]
    pub dot: bool,

    /// Plan with pruning enabled
    #[arg(long)]
    pub optimize: bool,
}

/// Arguments for the clean command
#[derive(Parser, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub rules: RulesArg,

    /// Also clear the local cache tier
    #[arg(long)]
    pub all: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default project configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for state tables
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON report
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build_flags() {
        let cli = Cli::parse_from([
            "manubuild",
            "build",
            "--rules",
            "pipeline.json",
            "-j",
            "4",
            "--force",
            "fig1",
            "--force",
            "fig2",
            "--optimize",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.rules.rules, PathBuf::from("pipeline.json"));
                assert_eq!(args.jobs, Some(4));
                assert_eq!(args.force, vec!["fig1", "fig2"]);
                assert!(args.optimize);
                assert!(!args.no_cache);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_rules_default() {
        let cli = Cli::parse_from(["manubuild", "plan", "--dot"]);
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.rules.rules, PathBuf::from("rules.json"));
                assert!(args.dot);
            }
            _ => panic!("expected Plan command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["manubuild", "-vv", "--no-local", "datasets"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.no_local);
        assert!(matches!(cli.command, Commands::Datasets));
    }

    #[test]
    fn cli_parses_config_init() {
        let cli = Cli::parse_from(["manubuild", "config", "init", "--force"]);
        match cli.command {
            Commands::Config(args) => {
                assert!(matches!(args.action, Some(ConfigAction::Init { force: true })));
            }
            _ => panic!("expected Config command"),
        }
    }

    #[test]
    fn cli_parses_clean_all() {
        let cli = Cli::parse_from(["manubuild", "clean", "--all"]);
        match cli.command {
            Commands::Clean(args) => assert!(args.all),
            _ => panic!("expected Clean command"),
        }
    }
}
