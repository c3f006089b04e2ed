//! Dataset materialization
//!
//! Each declared dataset is resolved to local files at most once per
//! materializer. Files already on disk with the expected content are left
//! alone; everything else is fetched from the deposit, extracting only the
//! named archive members.

use crate::cache::bundle;
use crate::cache::{ContentHasher, Digest, RemoteArchive};
use crate::dataset::manifest::{ArchiveKind, DatasetEntry, Source, Target};
use crate::error::{ManuError, ManuResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of materializing one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedDataset {
    pub id: String,

    /// Every local file the dataset declares
    pub files: Vec<PathBuf>,

    /// Number of deposit files transferred
    pub fetched: usize,
}

/// Resolves declared datasets into local files
pub struct DatasetMaterializer {
    root: PathBuf,
    datasets: BTreeMap<String, DatasetEntry>,
    archive: Arc<dyn RemoteArchive>,
    hasher: Arc<ContentHasher>,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<MaterializedDataset>>>>>,
}

impl DatasetMaterializer {
    pub fn new(
        root: impl Into<PathBuf>,
        datasets: BTreeMap<String, DatasetEntry>,
        archive: Arc<dyn RemoteArchive>,
        hasher: Arc<ContentHasher>,
    ) -> Self {
        Self {
            root: root.into(),
            datasets,
            archive,
            hasher,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Declared dataset ids
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.datasets.keys()
    }

    /// Local files a dataset produces, whether or not it is materialized
    pub fn declared_files(&self, id: &str) -> ManuResult<Vec<PathBuf>> {
        let entry = self
            .datasets
            .get(id)
            .ok_or_else(|| ManuError::User(format!("unknown dataset: {}", id)))?;
        Ok(entry
            .targets(&self.root)?
            .into_iter()
            .map(|t| t.local)
            .collect())
    }

    /// Materialize one dataset.
    ///
    /// Concurrent callers for the same id share one transfer. A failed
    /// attempt is not remembered, so a later call retries.
    pub async fn materialize(&self, id: &str) -> ManuResult<Arc<MaterializedDataset>> {
        let entry = self
            .datasets
            .get(id)
            .ok_or_else(|| ManuError::User(format!("unknown dataset: {}", id)))?;

        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            cells.entry(id.to_string()).or_default().clone()
        };

        let result = cell
            .get_or_try_init(|| async { self.run(id, entry).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(result))
    }

    /// Materialize every declared dataset concurrently.
    ///
    /// A failing dataset does not stop the others; results are sorted by id.
    pub async fn materialize_all(
        self: &Arc<Self>,
    ) -> Vec<(String, ManuResult<Arc<MaterializedDataset>>)> {
        let mut set = JoinSet::new();
        for id in self.datasets.keys().cloned() {
            let this = Arc::clone(self);
            set.spawn(async move {
                let result = this.materialize(&id).await;
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, result)) => {
                    if let Err(e) = &result {
                        error!("Dataset {} failed: {}", id, e);
                    }
                    results.push((id, result));
                }
                Err(e) => error!("Dataset task panicked: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    async fn run(&self, id: &str, entry: &DatasetEntry) -> ManuResult<MaterializedDataset> {
        let targets = entry.targets(&self.root)?;
        let files: Vec<PathBuf> = targets.iter().map(|t| t.local.clone()).collect();

        let mut pending: BTreeMap<String, Vec<Target>> = BTreeMap::new();
        for target in targets {
            if self.is_satisfied(&target) {
                debug!("{} is up to date", target.local.display());
                continue;
            }
            pending
                .entry(target.source.remote_name().to_string())
                .or_default()
                .push(target);
        }

        if pending.is_empty() {
            debug!("Dataset {} already materialized", id);
            return Ok(MaterializedDataset {
                id: id.to_string(),
                files,
                fetched: 0,
            });
        }

        let mut fetched = 0;
        for (remote_name, targets) in pending {
            info!("Fetching {} from deposit {}", remote_name, id);
            let bytes = self
                .archive
                .fetch(id, &remote_name)
                .await?
                .ok_or_else(|| ManuError::MissingRemoteFile {
                    deposit: id.to_string(),
                    name: remote_name.clone(),
                })?;
            fetched += 1;

            let contents = resolve_contents(id, &remote_name, bytes, &targets).await?;
            for target in &targets {
                let name = target.source.display_name();
                let data = contents
                    .get(&name)
                    .ok_or_else(|| ManuError::MissingRemoteFile {
                        deposit: id.to_string(),
                        name: name.clone(),
                    })?;
                self.write_target(target, data).await?;
            }
        }

        Ok(MaterializedDataset {
            id: id.to_string(),
            files,
            fetched,
        })
    }

    fn is_satisfied(&self, target: &Target) -> bool {
        if !target.local.is_file() {
            return false;
        }
        let Some(expected) = target.sha256 else {
            return true;
        };
        match self.hasher.hash_file(&target.local) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                warn!(
                    "{} has hash {}, expected {}; fetching again",
                    target.local.display(),
                    actual.short(),
                    expected.short()
                );
                false
            }
            Err(e) => {
                warn!("Cannot hash {}: {}", target.local.display(), e);
                false
            }
        }
    }

    async fn write_target(&self, target: &Target, data: &[u8]) -> ManuResult<()> {
        if let Some(expected) = target.sha256 {
            let actual = Digest::of(data);
            if actual != expected {
                return Err(ManuError::HashMismatch {
                    path: target.local.clone(),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }

        write_file_atomic(&target.local, data).await?;
        self.hasher.invalidate(&target.local);
        debug!("Wrote {} ({} bytes)", target.local.display(), data.len());
        Ok(())
    }
}

/// Map each target's display name to its bytes, unpacking archives as needed
async fn resolve_contents(
    deposit: &str,
    remote_name: &str,
    bytes: Vec<u8>,
    targets: &[Target],
) -> ManuResult<HashMap<String, Vec<u8>>> {
    let mut by_chain: BTreeMap<Vec<String>, BTreeSet<String>> = BTreeMap::new();
    let mut direct = false;
    for target in targets {
        match &target.source {
            Source::Remote { .. } => direct = true,
            Source::Member { chain, member } => {
                by_chain
                    .entry(chain.clone())
                    .or_default()
                    .insert(member.clone());
            }
        }
    }

    let deposit = deposit.to_string();
    let remote_name = remote_name.to_string();
    tokio::task::spawn_blocking(move || {
        let mut contents = HashMap::new();
        for (chain, members) in by_chain {
            let data = open_chain(&deposit, &bytes, &chain)?;
            let kind = archive_kind(&chain)?;
            for (member, member_bytes) in bundle::extract_members(&data, kind, &members)? {
                let mut parts = chain.clone();
                parts.push(member);
                contents.insert(parts.join("/"), member_bytes);
            }
        }
        if direct {
            contents.insert(remote_name, bytes);
        }
        Ok(contents)
    })
    .await
    .map_err(|e| ManuError::Internal(format!("extraction task panicked: {}", e)))?
}

/// Descend through nested archives, returning the bytes of the innermost one
fn open_chain(deposit: &str, outer: &[u8], chain: &[String]) -> ManuResult<Vec<u8>> {
    let mut data = outer.to_vec();
    for depth in 1..chain.len() {
        let kind = archive_kind(&chain[..depth])?;
        let wanted: BTreeSet<String> = [chain[depth].clone()].into();
        let mut found = bundle::extract_members(&data, kind, &wanted)?;
        data = found
            .remove(&chain[depth])
            .ok_or_else(|| ManuError::MissingRemoteFile {
                deposit: deposit.to_string(),
                name: chain[..=depth].join("/"),
            })?;
    }
    Ok(data)
}

fn archive_kind(chain: &[String]) -> ManuResult<ArchiveKind> {
    let name = chain.last().map(String::as_str).unwrap_or_default();
    ArchiveKind::detect(name).ok_or_else(|| ManuError::Archive {
        name: name.to_string(),
        reason: "unsupported archive format".to_string(),
    })
}

async fn write_file_atomic(path: &Path, data: &[u8]) -> ManuResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
    }
    let tmp = path.with_extension(format!("part-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| ManuError::io(format!("writing {}", tmp.display()), e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ManuError::io(format!("moving {} into place", path.display()), e));
    }
    Ok(())
}
