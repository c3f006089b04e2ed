//! Explicit build context
//!
//! Everything process-wide a build needs (project root, cache store,
//! hasher, flags) is bundled here and passed down, so tests can swap the
//! remote tier for a double.

use crate::cache::{CacheStore, ContentHasher, LocalStore, RemoteArchive};
use crate::config::{is_ci, Config, ConfigManager};
use crate::graph::Rule;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags controlling one build
#[derive(Debug, Clone)]
pub struct BuildFlags {
    /// Consult and populate the cache
    pub cache_enabled: bool,

    /// Cacheable rules may be recomputed after a remote miss
    pub remote_fallback: bool,

    /// Skip restoring cached rules no stale rule needs
    pub optimize: bool,

    /// Rules rebuilt regardless of cache state
    pub force: BTreeSet<String>,

    /// Missing leaf inputs abort the build before execution
    pub require_inputs: bool,

    /// Worker pool size
    pub jobs: usize,
}

impl Default for BuildFlags {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            remote_fallback: true,
            optimize: false,
            force: BTreeSet::new(),
            require_inputs: true,
            jobs: 1,
        }
    }
}

impl BuildFlags {
    /// Flags from configuration, before CLI overrides
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_enabled: config.cache.enabled,
            remote_fallback: !is_ci() || config.cache.run_cacheable_on_ci,
            optimize: config.cache.optimize,
            force: config.build.force.iter().cloned().collect(),
            require_inputs: config.build.require_inputs,
            jobs: config.build.effective_jobs(),
        }
    }
}

/// State shared by every phase of a build
pub struct BuildContext {
    pub root: PathBuf,
    pub store: CacheStore,
    pub hasher: Arc<ContentHasher>,
    pub flags: BuildFlags,

    /// Deposit for cacheable rules without their own
    pub default_deposit: Option<String>,

    /// Leaf inputs whose absence is already explained (failed datasets)
    pub excused_inputs: HashSet<PathBuf>,
}

impl BuildContext {
    pub fn new(
        root: impl Into<PathBuf>,
        store: CacheStore,
        hasher: Arc<ContentHasher>,
        flags: BuildFlags,
    ) -> Self {
        Self {
            root: root.into(),
            store,
            hasher,
            flags,
            default_deposit: None,
            excused_inputs: HashSet::new(),
        }
    }

    /// Context from configuration: local tier under the project, remote tier
    /// from `remote` when remote caching is enabled
    pub fn from_config(
        config: &Config,
        root: &Path,
        flags: BuildFlags,
        remote: Option<Arc<dyn RemoteArchive>>,
        branch: Option<&str>,
    ) -> Self {
        let local = LocalStore::new(ConfigManager::cache_dir(config, root));
        let mut store = CacheStore::new(local);
        if let Some(archive) = remote.filter(|_| config.cache.remote.enabled) {
            store = store.with_remote(archive, config.cache.remote.required);
        }
        let hasher = Arc::new(ContentHasher::load(&ConfigManager::hash_memo_path(root)));

        let mut ctx = Self::new(root, store, hasher, flags);
        ctx.default_deposit = config.cache.remote.deposit_for(branch).map(str::to_string);
        ctx
    }

    pub fn with_default_deposit(mut self, deposit: impl Into<String>) -> Self {
        self.default_deposit = Some(deposit.into());
        self
    }

    /// Deposit to query for `rule`, if it uses the remote tier at all
    pub fn deposit_for(&self, rule: &Rule) -> Option<String> {
        if !rule.cacheable || !self.store.remote_enabled() {
            return None;
        }
        rule.cache_deposit
            .clone()
            .or_else(|| self.default_deposit.clone())
    }

    /// Whether `rule` may run locally after missing the cache
    pub fn may_recompute(&self, rule: &Rule) -> bool {
        self.flags.remote_fallback || self.deposit_for(rule).is_none()
    }

    pub fn is_forced(&self, rule: &Rule) -> bool {
        self.flags.force.contains(&rule.id)
    }

    /// Absolute path of a project-relative file
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}
