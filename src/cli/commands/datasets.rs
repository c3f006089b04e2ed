//! Datasets command - fetch declared datasets

use crate::cache::ContentHasher;
use crate::cli::commands::dataset_materializer;
use crate::config::{Config, ConfigManager};
use crate::error::{ManuError, ManuResult};
use crate::ui::{self, UiContext};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Execute the datasets command
pub async fn execute(config: &Config, root: &Path) -> ManuResult<()> {
    let ctx = UiContext::detect();
    let memo = ConfigManager::hash_memo_path(root);
    let hasher = Arc::new(ContentHasher::load(&memo));

    let Some(materializer) = dataset_materializer(config, root, Arc::clone(&hasher)) else {
        ui::step_info(&ctx, "No datasets declared");
        return Ok(());
    };

    let results = materializer.materialize_all().await;
    let mut failed = 0;
    for (id, result) in &results {
        match result {
            Ok(done) if done.fetched == 0 => {
                ui::step_ok_detail(&ctx, id, &format!("{} file(s) up to date", done.files.len()))
            }
            Ok(done) => ui::step_ok_detail(&ctx, id, &format!("{} fetched", done.fetched)),
            Err(e) => {
                failed += 1;
                ui::step_error_detail(&ctx, id, &e.to_string());
            }
        }
    }

    if let Err(e) = hasher.save(&memo) {
        warn!("Could not save hash memo: {}", e);
    }

    if failed > 0 {
        return Err(ManuError::User(format!(
            "{} of {} dataset(s) failed",
            failed,
            results.len()
        )));
    }
    Ok(())
}
