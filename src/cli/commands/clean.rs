//! Clean command - remove rule outputs and optionally the local cache

use crate::cache::{format_bytes, LocalStore};
use crate::cli::args::CleanArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{ManuError, ManuResult};
use crate::graph::load_graph;
use crate::ui::{self, UiContext};
use std::path::Path;
use tokio::fs;

/// Execute the clean command
pub async fn execute(args: CleanArgs, config: &Config, root: &Path) -> ManuResult<()> {
    let ctx = UiContext::detect();
    let graph = load_graph(&args.rules.rules, config).await?;

    let mut removed = 0;
    for output in graph.rules().iter().flat_map(|r| r.outputs.iter()) {
        let path = root.join(output);
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ManuError::io(format!("removing {}", path.display()), e)),
        }
    }
    ui::step_ok(&ctx, &format!("Removed {} output file(s)", removed));

    if args.all {
        let cache_dir = ConfigManager::cache_dir(config, root);
        let store = LocalStore::new(cache_dir.clone());
        let (entries, size) = store.stats();
        store.clear()?;

        let memo = ConfigManager::hash_memo_path(root);
        if memo.exists() {
            fs::remove_file(&memo)
                .await
                .map_err(|e| ManuError::io(format!("removing {}", memo.display()), e))?;
        }
        ui::step_ok_detail(
            &ctx,
            &format!("Cleared {} cache entries", entries),
            &format_bytes(size),
        );
        ui::key_value(&ctx, "Cache", &cache_dir.display().to_string());
    }

    Ok(())
}
