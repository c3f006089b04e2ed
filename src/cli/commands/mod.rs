//! CLI command implementations

pub mod build;
pub mod clean;
pub mod config;
pub mod datasets;
pub mod plan;

pub use build::execute as build;
pub use clean::execute as clean;
pub use config::execute as config;
pub use datasets::execute as datasets;
pub use plan::execute as plan;

use crate::cache::http::HttpArchive;
use crate::cache::{ContentHasher, RemoteArchive};
use crate::config::{detect_branch, Config};
use crate::dataset::DatasetMaterializer;
use crate::engine::{BuildContext, BuildFlags, Engine, ShellRunner};
use crate::error::ManuResult;
use crate::graph::load_graph;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Archive client for the configured service
fn archive(config: &Config) -> Arc<dyn RemoteArchive> {
    Arc::new(HttpArchive::from_config(&config.cache.remote))
}

/// Materializer for the declared datasets, if there are any
pub(crate) fn dataset_materializer(
    config: &Config,
    root: &Path,
    hasher: Arc<ContentHasher>,
) -> Option<Arc<DatasetMaterializer>> {
    if config.datasets.is_empty() {
        return None;
    }
    Some(Arc::new(DatasetMaterializer::new(
        root,
        config.datasets.clone(),
        archive(config),
        hasher,
    )))
}

/// Load the rules file and wire up an engine for `root`
pub(crate) async fn open_engine(
    config: &Config,
    root: &Path,
    rules: &Path,
    flags: BuildFlags,
) -> ManuResult<Engine> {
    let graph = load_graph(rules, config).await?;
    debug!("Loaded {} rules from {}", graph.len(), rules.display());

    for id in &flags.force {
        graph.index_of(id)?;
    }

    let remote = config.cache.remote.enabled.then(|| archive(config));
    let branch = detect_branch(root).await;
    debug!("Branch: {}", branch.as_deref().unwrap_or("(unknown)"));

    let ctx = BuildContext::from_config(config, root, flags, remote, branch.as_deref());
    let runner = Arc::new(ShellRunner::new(config.build.shell.clone()));

    match dataset_materializer(config, root, Arc::clone(&ctx.hasher)) {
        Some(datasets) => Engine::with_datasets(graph, ctx, runner, datasets),
        None => Ok(Engine::new(graph, ctx, runner)),
    }
}
