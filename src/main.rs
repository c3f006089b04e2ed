//! manubuild CLI entry point

use clap::Parser;
use console::style;
use manubuild::cli::{commands, Cli, Commands};
use manubuild::config::{Config, ConfigManager};
use manubuild::error::{ManuError, ManuResult};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn, 1 = info, 2+ = debug
    let level = match verbose.max(u8::from(config.general.verbose)) {
        0 => "manubuild=warn",
        1 => "manubuild=info",
        _ => "manubuild=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> ManuResult<u8> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let cwd = std::env::current_dir().map_err(|e| ManuError::io("getting current directory", e))?;
    let local_config_path = if cli.no_local {
        None
    } else {
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;
    init_logging(cli.verbose, &config);

    // The project root is where the local config lives, else the working directory
    let root: PathBuf = local_config_path
        .as_deref()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .unwrap_or(cwd);
    debug!("Project root: {}", root.display());
    if let Some(ref path) = local_config_path {
        debug!("Using local config: {}", path.display());
    }

    match cli.command {
        Commands::Build(args) => commands::build(args, &config, &root).await,
        Commands::Plan(args) => commands::plan(args, &config, &root).await.map(|()| 0),
        Commands::Datasets => commands::datasets(&config, &root).await.map(|()| 0),
        Commands::Clean(args) => commands::clean(args, &config, &root).await.map(|()| 0),
        Commands::Config(args) => commands::config(args, &config, &config_manager)
            .await
            .map(|()| 0),
    }
}
