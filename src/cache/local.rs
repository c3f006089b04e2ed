//! Local directory tier
//!
//! Layout under the cache root:
//!
//! ```text
//! entries/<key>/meta.json      complete entries
//! entries/<key>/outputs/<n>    output blobs, in declaration order
//! remote/<key>.json            metadata of entries known to live remotely
//! tmp/<uuid>/                  entries being written
//! ```
//!
//! An entry is assembled under `tmp/` and renamed into `entries/` in one
//! step, so readers never see a partial entry. Entries are immutable: a put
//! for an existing key is skipped.

use crate::cache::bundle;
use crate::cache::entry::EntryMeta;
use crate::cache::hasher::CacheKey;
use crate::error::{ManuError, ManuResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const META_FILE: &str = "meta.json";
const OUTPUTS_DIR: &str = "outputs";

/// Outcome of a local put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// An entry with this key already existed
    Skipped,
}

/// Local on-disk cache tier
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join("entries").join(key.to_hex())
    }

    fn remote_meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join("remote").join(format!("{}.json", key.to_hex()))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp").join(Uuid::new_v4().to_string())
    }

    /// Whether a complete entry exists
    pub fn has(&self, key: &CacheKey) -> bool {
        self.entry_dir(key).join(META_FILE).is_file()
    }

    /// Read the metadata of a complete entry
    pub fn get(&self, key: &CacheKey) -> ManuResult<Option<EntryMeta>> {
        read_meta(&self.entry_dir(key).join(META_FILE), key)
    }

    /// Read write-through metadata of a remote entry
    pub fn get_remote_meta(&self, key: &CacheKey) -> ManuResult<Option<EntryMeta>> {
        read_meta(&self.remote_meta_path(key), key)
    }

    /// Record metadata of an entry found in the remote tier
    pub fn put_remote_meta(&self, meta: &EntryMeta) -> ManuResult<()> {
        let path = self.remote_meta_path(&meta.key);
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&path, &json, &self.root.join("tmp"))
    }

    /// Store `sources` as the outputs of `meta`.
    ///
    /// `sources[i]` is the file holding `meta.outputs[i]`.
    pub fn put(&self, meta: &EntryMeta, sources: &[PathBuf]) -> ManuResult<PutOutcome> {
        if sources.len() != meta.outputs.len() {
            return Err(ManuError::Internal(format!(
                "entry {} lists {} outputs but {} files were given",
                meta.key.short(),
                meta.outputs.len(),
                sources.len()
            )));
        }

        let dest = self.entry_dir(&meta.key);
        if self.has(&meta.key) {
            debug!("Entry {} already cached, skipping put", meta.key.short());
            return Ok(PutOutcome::Skipped);
        }

        let tmp = self.tmp_dir();
        let outputs = tmp.join(OUTPUTS_DIR);
        fs::create_dir_all(&outputs)
            .map_err(|e| ManuError::io(format!("creating {}", outputs.display()), e))?;

        let staged = (|| -> ManuResult<()> {
            for (index, source) in sources.iter().enumerate() {
                let blob = outputs.join(index.to_string());
                fs::copy(source, &blob).map_err(|e| {
                    ManuError::io(format!("copying {} into cache", source.display()), e)
                })?;
            }
            fs::write(tmp.join(META_FILE), serde_json::to_vec_pretty(meta)?)
                .map_err(|e| ManuError::io("writing entry metadata", e))
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        self.commit(&tmp, &dest, &meta.key)
    }

    /// Install an entry unpacked from a remote bundle
    pub fn put_bundle(&self, key: &CacheKey, bundle_bytes: &[u8]) -> ManuResult<PutOutcome> {
        if self.has(key) {
            return Ok(PutOutcome::Skipped);
        }

        let tmp = self.tmp_dir();
        if let Err(e) = bundle::unpack_into(bundle_bytes, &tmp) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        match read_meta(&tmp.join(META_FILE), key) {
            Ok(Some(meta)) if meta.outputs.len() <= count_blobs(&tmp.join(OUTPUTS_DIR)) => {}
            Ok(_) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(ManuError::CacheCorrupt {
                    key: key.to_hex(),
                    reason: "bundle is missing metadata or output blobs".to_string(),
                });
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(e);
            }
        }

        self.commit(&tmp, &self.entry_dir(key), key)
    }

    fn commit(&self, tmp: &Path, dest: &Path, key: &CacheKey) -> ManuResult<PutOutcome> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
        }

        match fs::rename(tmp, dest) {
            Ok(()) => {
                debug!("Cached entry {}", key.short());
                Ok(PutOutcome::Written)
            }
            Err(_) if self.has(key) => {
                // Lost a race with another writer of the same key
                let _ = fs::remove_dir_all(tmp);
                Ok(PutOutcome::Skipped)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(tmp);
                Err(ManuError::io(
                    format!("moving entry into place at {}", dest.display()),
                    e,
                ))
            }
        }
    }

    /// Path of the blob holding output `index` of an entry
    pub fn blob_path(&self, key: &CacheKey, index: usize) -> PathBuf {
        self.entry_dir(key).join(OUTPUTS_DIR).join(index.to_string())
    }

    /// Tarball of a complete entry, for upload
    pub fn bundle(&self, key: &CacheKey) -> ManuResult<Vec<u8>> {
        bundle::pack_dir(&self.entry_dir(key))
    }

    /// Copy an entry's outputs to their paths under `project_root`
    pub fn restore(&self, meta: &EntryMeta, project_root: &Path) -> ManuResult<()> {
        for (index, output) in meta.outputs.iter().enumerate() {
            let blob = self.blob_path(&meta.key, index);
            let dest = project_root.join(&output.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
            }
            let tmp = dest.with_extension(format!("manubuild-{}", Uuid::new_v4().simple()));
            fs::copy(&blob, &tmp).map_err(|e| {
                ManuError::io(format!("restoring {} from cache", output.path.display()), e)
            })?;
            fs::rename(&tmp, &dest).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                ManuError::io(format!("restoring {}", dest.display()), e)
            })?;
        }
        debug!("Restored {} outputs of {}", meta.outputs.len(), meta.rule);
        Ok(())
    }

    /// Number of complete entries and their total size
    pub fn stats(&self) -> (usize, u64) {
        let Ok(entries) = fs::read_dir(self.root.join("entries")) else {
            return (0, 0);
        };
        entries
            .flatten()
            .filter_map(|e| read_meta_unchecked(&e.path().join(META_FILE)))
            .fold((0, 0), |(count, size), meta| (count + 1, size + meta.size))
    }

    /// Remove the whole tier
    pub fn clear(&self) -> ManuResult<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .map_err(|e| ManuError::io(format!("removing {}", self.root.display()), e))?;
        }
        Ok(())
    }
}

fn read_meta(path: &Path, key: &CacheKey) -> ManuResult<Option<EntryMeta>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ManuError::io(format!("reading {}", path.display()), e)),
    };
    let meta: EntryMeta = serde_json::from_slice(&bytes).map_err(|e| ManuError::CacheCorrupt {
        key: key.to_hex(),
        reason: e.to_string(),
    })?;
    if meta.key != *key {
        return Err(ManuError::CacheCorrupt {
            key: key.to_hex(),
            reason: format!("metadata names key {}", meta.key),
        });
    }
    Ok(Some(meta))
}

fn read_meta_unchecked(path: &Path) -> Option<EntryMeta> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

fn count_blobs(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.flatten().count()).unwrap_or(0)
}

fn write_atomic(path: &Path, data: &[u8], tmp_root: &Path) -> ManuResult<()> {
    fs::create_dir_all(tmp_root)
        .map_err(|e| ManuError::io(format!("creating {}", tmp_root.display()), e))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
    }
    let tmp = tmp_root.join(Uuid::new_v4().to_string());
    fs::write(&tmp, data).map_err(|e| ManuError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ManuError::io(format!("moving {} into place", path.display()), e)
    })
}
