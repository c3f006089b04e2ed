//! Content-addressed build cache
//!
//! Rule outputs are stored under a key derived from the rule's specification
//! hash and its input digests. Entries are immutable once written.
//!
//! # Tiers
//!
//! | Tier | Holds | Consulted |
//! |------|-------|-----------|
//! | Local | metadata + blobs | always first |
//! | Remote | `<key>.json` + `<key>.tar.gz` per deposit | cacheable rules, on local miss |
//!
//! A remote hit writes its metadata through to the local tier at once; the
//! blobs follow only when the outputs are actually restored.
//!
//! Remote failures degrade to a miss with a warning unless the remote tier
//! is mandatory, in which case they are errors.

pub mod bundle;
pub mod entry;
pub mod hasher;
pub mod http;
pub mod local;
pub mod remote;

pub use entry::{format_bytes, CacheEntry, CachedOutput, EntryMeta, Lookup, Tier};
pub use hasher::{CacheKey, ContentHasher, Digest};
pub use local::{LocalStore, PutOutcome};
pub use remote::{MemoryArchive, RemoteArchive, RemoteFile};

use crate::error::{ManuError, ManuResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote file holding an entry's metadata
pub fn meta_name(key: &CacheKey) -> String {
    format!("{}.json", key.to_hex())
}

/// Remote file holding an entry's bundle
pub fn bundle_name(key: &CacheKey) -> String {
    format!("{}.tar.gz", key.to_hex())
}

struct RemoteTier {
    archive: Arc<dyn RemoteArchive>,
    mandatory: bool,
}

/// Two-tier cache client
pub struct CacheStore {
    local: LocalStore,
    remote: Option<RemoteTier>,
}

impl CacheStore {
    /// Local-only store
    pub fn new(local: LocalStore) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// Attach a remote tier. With `mandatory`, remote failures are errors.
    pub fn with_remote(mut self, archive: Arc<dyn RemoteArchive>, mandatory: bool) -> Self {
        self.remote = Some(RemoteTier { archive, mandatory });
        self
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Look up an entry.
    ///
    /// The remote tier is only asked when `deposit` is given, i.e. for
    /// cacheable rules with remote caching enabled.
    pub async fn get(&self, key: &CacheKey, deposit: Option<&str>) -> ManuResult<Lookup> {
        if let Some(meta) = self.local.get(key)? {
            debug!("Local hit {}", key.short());
            return Ok(Lookup::Hit(CacheEntry {
                meta,
                tier: Tier::Local,
            }));
        }

        let (Some(remote), Some(deposit)) = (&self.remote, deposit) else {
            return Ok(Lookup::Miss);
        };

        if let Some(meta) = self.local.get_remote_meta(key)? {
            debug!("Remote hit {} (indexed)", key.short());
            return Ok(Lookup::Hit(CacheEntry {
                meta,
                tier: Tier::Remote {
                    deposit: deposit.to_string(),
                },
            }));
        }

        match remote.archive.fetch(deposit, &meta_name(key)).await {
            Ok(Some(bytes)) => {
                let meta: EntryMeta = match serde_json::from_slice(&bytes) {
                    Ok(meta) => meta,
                    Err(e) => {
                        return self.degrade(ManuError::CacheCorrupt {
                            key: key.to_hex(),
                            reason: e.to_string(),
                        })
                    }
                };
                if meta.key != *key {
                    return self.degrade(ManuError::CacheCorrupt {
                        key: key.to_hex(),
                        reason: format!("remote metadata names key {}", meta.key),
                    });
                }
                self.local.put_remote_meta(&meta)?;
                debug!("Remote hit {} in deposit {}", key.short(), deposit);
                Ok(Lookup::Hit(CacheEntry {
                    meta,
                    tier: Tier::Remote {
                        deposit: deposit.to_string(),
                    },
                }))
            }
            Ok(None) => Ok(Lookup::Miss),
            Err(e) => self.degrade(e),
        }
    }

    /// Whether an entry exists in a tier that `get` would consult
    pub async fn has(&self, key: &CacheKey, deposit: Option<&str>) -> ManuResult<bool> {
        if self.local.has(key) {
            return Ok(true);
        }
        let (Some(remote), Some(deposit)) = (&self.remote, deposit) else {
            return Ok(false);
        };
        match remote.archive.list(deposit).await {
            Ok(files) => {
                let name = meta_name(key);
                Ok(files.iter().any(|f| f.name == name))
            }
            Err(e) => self.degrade(e).map(|lookup| lookup.is_hit()),
        }
    }

    /// Store fresh outputs in the local tier
    pub fn put(&self, meta: &EntryMeta, sources: &[PathBuf]) -> ManuResult<PutOutcome> {
        self.local.put(meta, sources)
    }

    /// Upload a local entry to the remote tier.
    ///
    /// Idempotent per key: nothing is sent when the deposit already holds
    /// the entry. Returns whether anything was uploaded. On success the
    /// entry is recorded in the local remote index.
    pub async fn upload(&self, key: &CacheKey, deposit: &str) -> ManuResult<bool> {
        let Some(remote) = &self.remote else {
            return Ok(false);
        };
        let Some(meta) = self.local.get(key)? else {
            return Err(ManuError::Internal(format!(
                "cannot upload {}: not in the local cache",
                key.short()
            )));
        };

        let result: ManuResult<bool> = async {
            let listed = remote.archive.list(deposit).await?;
            let meta_file = meta_name(key);
            let bundle_file = bundle_name(key);
            let has_meta = listed.iter().any(|f| f.name == meta_file);
            let has_bundle = listed.iter().any(|f| f.name == bundle_file);
            if has_meta && has_bundle {
                debug!("Entry {} already in deposit {}", key.short(), deposit);
                return Ok(false);
            }

            // Bundle first: a listed metadata file implies a usable bundle
            if !has_bundle {
                let bytes = self.local.bundle(key)?;
                remote.archive.upload(deposit, &bundle_file, bytes).await?;
            }
            if !has_meta {
                let json = serde_json::to_vec_pretty(&meta)?;
                remote.archive.upload(deposit, &meta_file, json).await?;
            }
            info!("Uploaded {} ({}) to deposit {}", meta.rule, key.short(), deposit);
            Ok(true)
        }
        .await;

        match result {
            Ok(uploaded) => {
                self.local.put_remote_meta(&meta)?;
                Ok(uploaded)
            }
            Err(e) if remote.mandatory || e.is_structural() => Err(e),
            Err(e) => {
                warn!("Upload of {} to deposit {} failed: {}", key.short(), deposit, e);
                Ok(false)
            }
        }
    }

    /// Upload a local hit unless the remote index already knows the entry.
    ///
    /// Catches up on uploads that failed in an earlier build.
    pub async fn publish(&self, key: &CacheKey, deposit: &str) -> ManuResult<bool> {
        if self.remote.is_none() || self.local.get_remote_meta(key)?.is_some() {
            return Ok(false);
        }
        self.upload(key, deposit).await
    }

    /// Whether a failed restore may fall back to running the rule
    pub fn can_recompute_after(&self, err: &ManuError) -> bool {
        let mandatory = self.remote.as_ref().is_some_and(|r| r.mandatory);
        !mandatory && err.is_retryable()
    }

    /// Copy an entry's outputs into the project, fetching the remote bundle
    /// first if the blobs are not local yet
    pub async fn restore(&self, entry: &CacheEntry, project_root: &Path) -> ManuResult<()> {
        let key = entry.key();
        if !self.local.has(&key) {
            let Tier::Remote { deposit } = &entry.tier else {
                return Err(ManuError::CacheCorrupt {
                    key: key.to_hex(),
                    reason: "local entry disappeared".to_string(),
                });
            };
            let remote = self.remote.as_ref().ok_or_else(|| {
                ManuError::unavailable("remote entry found but remote tier is disabled")
            })?;

            let bytes = remote
                .archive
                .fetch(deposit, &bundle_name(&key))
                .await?
                .ok_or_else(|| ManuError::CacheCorrupt {
                    key: key.to_hex(),
                    reason: format!("deposit {} lists metadata but no bundle", deposit),
                })?;
            self.local.put_bundle(&key, &bytes)?;
            debug!("Fetched bundle {} from deposit {}", key.short(), deposit);
        }

        self.local.restore(&entry.meta, project_root)
    }

    fn degrade(&self, err: ManuError) -> ManuResult<Lookup> {
        match &self.remote {
            Some(remote) if remote.mandatory => Err(match err {
                ManuError::CacheUnavailable { .. } => err,
                other => ManuError::unavailable(other.to_string()),
            }),
            _ => {
                warn!("Remote cache degraded to local-only: {}", err);
                Ok(Lookup::Miss)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _cache: TempDir,
        work: TempDir,
        store: CacheStore,
        archive: Arc<MemoryArchive>,
    }

    fn fixture(mandatory: bool) -> Fixture {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let archive = Arc::new(MemoryArchive::new());
        let store = CacheStore::new(LocalStore::new(cache.path()))
            .with_remote(archive.clone(), mandatory);
        Fixture {
            _cache: cache,
            work,
            store,
            archive,
        }
    }

    fn produce(dir: &Path, name: &str, data: &[u8]) -> (EntryMeta, Vec<PathBuf>) {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        let digest = Digest::of(data);
        let key = CacheKey::derive(name, &[digest]);
        let meta = EntryMeta::new(
            key,
            name,
            vec![CachedOutput {
                path: PathBuf::from(name),
                digest,
                size: data.len() as u64,
            }],
        );
        (meta, vec![path])
    }

    #[tokio::test]
    async fn local_hit_never_touches_remote() {
        let f = fixture(false);
        let (meta, sources) = produce(f.work.path(), "fig.pdf", b"pdf");
        f.store.put(&meta, &sources).unwrap();

        let lookup = f.store.get(&meta.key, Some("dep")).await.unwrap();
        assert!(matches!(lookup, Lookup::Hit(CacheEntry { tier: Tier::Local, .. })));
        assert_eq!(f.archive.calls().fetch, 0);
    }

    #[tokio::test]
    async fn remote_hit_writes_metadata_through() {
        let f = fixture(false);
        let (meta, sources) = produce(f.work.path(), "fig.pdf", b"pdf");
        f.store.put(&meta, &sources).unwrap();
        assert!(f.store.upload(&meta.key, "dep").await.unwrap());

        // Second machine: empty local tier, same archive
        let other_cache = TempDir::new().unwrap();
        let other = CacheStore::new(LocalStore::new(other_cache.path()))
            .with_remote(f.archive.clone(), false);

        let lookup = other.get(&meta.key, Some("dep")).await.unwrap();
        let Lookup::Hit(entry) = lookup else {
            panic!("expected remote hit");
        };
        assert_eq!(entry.meta.outputs, meta.outputs);
        assert!(other.local().get_remote_meta(&meta.key).unwrap().is_some());

        f.archive.reset_calls();
        other.get(&meta.key, Some("dep")).await.unwrap();
        assert_eq!(f.archive.calls().fetch, 0);

        let project = TempDir::new().unwrap();
        other.restore(&entry, project.path()).await.unwrap();
        assert_eq!(fs::read(project.path().join("fig.pdf")).unwrap(), b"pdf");
        assert!(other.local().has(&meta.key));
    }

    #[tokio::test]
    async fn no_deposit_means_local_only() {
        let f = fixture(false);
        let key = CacheKey::derive("x", &[]);
        assert_eq!(f.store.get(&key, None).await.unwrap(), Lookup::Miss);
        assert!(!f.store.has(&key, None).await.unwrap());
        assert_eq!(f.archive.calls(), remote::CallCounts::default());
    }

    #[tokio::test]
    async fn remote_failure_degrades_to_miss() {
        let f = fixture(false);
        f.archive.set_offline(true);
        let key = CacheKey::derive("x", &[]);
        assert_eq!(f.store.get(&key, Some("dep")).await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn mandatory_remote_failure_is_error() {
        let f = fixture(true);
        f.archive.set_offline(true);
        let key = CacheKey::derive("x", &[]);
        let err = f.store.get(&key, Some("dep")).await.unwrap_err();
        assert!(matches!(err, ManuError::CacheUnavailable { .. }));
    }

    #[tokio::test]
    async fn upload_is_idempotent() {
        let f = fixture(false);
        let (meta, sources) = produce(f.work.path(), "t.tex", b"table");
        f.store.put(&meta, &sources).unwrap();

        assert!(f.store.upload(&meta.key, "dep").await.unwrap());
        assert!(!f.store.upload(&meta.key, "dep").await.unwrap());
        assert_eq!(f.archive.calls().upload, 2);
        assert!(f.store.has(&meta.key, Some("dep")).await.unwrap());
        assert_eq!(
            f.archive.names("dep"),
            vec![meta_name(&meta.key), bundle_name(&meta.key)]
        );
    }

    #[tokio::test]
    async fn publish_catches_up_after_failed_upload() {
        let f = fixture(false);
        let (meta, sources) = produce(f.work.path(), "t.tex", b"table");
        f.store.put(&meta, &sources).unwrap();

        f.archive.set_offline(true);
        assert!(!f.store.publish(&meta.key, "dep").await.unwrap());
        assert!(f.archive.names("dep").is_empty());

        f.archive.set_offline(false);
        assert!(f.store.publish(&meta.key, "dep").await.unwrap());
        assert_eq!(f.archive.names("dep").len(), 2);

        // Indexed now: no further round trips
        f.archive.reset_calls();
        assert!(!f.store.publish(&meta.key, "dep").await.unwrap());
        assert_eq!(f.archive.calls(), remote::CallCounts::default());
    }

    #[test]
    fn only_optional_remote_failures_allow_recompute() {
        let unavailable = ManuError::unavailable("offline");
        assert!(fixture(false).store.can_recompute_after(&unavailable));
        assert!(!fixture(true).store.can_recompute_after(&unavailable));
        assert!(!fixture(false).store.can_recompute_after(&ManuError::CacheCorrupt {
            key: "k".to_string(),
            reason: "bad".to_string(),
        }));
    }

    #[tokio::test]
    async fn failed_upload_is_a_warning() {
        let f = fixture(false);
        let (meta, sources) = produce(f.work.path(), "t.tex", b"table");
        f.store.put(&meta, &sources).unwrap();
        f.archive.set_offline(true);

        assert!(!f.store.upload(&meta.key, "dep").await.unwrap());
    }
}
