//! Content hashing and cache key derivation
//!
//! Artifacts are identified by the SHA-256 of their bytes. A rule's cache key
//! is derived from its specification hash and the digests of its inputs, in
//! declaration order: permuting inputs yields a different key.

use crate::error::{ManuError, ManuResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Domain separator mixed into every rule key
const RULE_KEY_TAG: &[u8] = b"manubuild.rule-key.v1\0";

/// Fixed-width content digest (SHA-256)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of an in-memory buffer
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex chars, for display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid sha256 digest: {}", s)))
    }
}

/// Content-derived identity of one rule evaluation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Digest);

impl CacheKey {
    /// Derive a key from a rule's specification hash and its input digests.
    ///
    /// Pure: the same arguments always give the same key.
    pub fn derive(spec_hash: &str, inputs: &[Digest]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(RULE_KEY_TAG);
        hasher.update((spec_hash.len() as u64).to_le_bytes());
        hasher.update(spec_hash.as_bytes());
        hasher.update((inputs.len() as u64).to_le_bytes());
        for digest in inputs {
            hasher.update(digest.as_bytes());
        }
        Self(Digest(hasher.finalize().into()))
    }

    /// Parse from the hex form used in file names
    pub fn from_hex(s: &str) -> Option<Self> {
        Digest::from_hex(s).map(Self)
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Shortened hex for display
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

/// Identity of a file on disk at the time it was hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileStamp {
    mtime_secs: u64,
    mtime_nanos: u32,
    size: u64,
}

impl FileStamp {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            mtime_secs: mtime.as_secs(),
            mtime_nanos: mtime.subsec_nanos(),
            size: meta.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoEntry {
    stamp: FileStamp,
    digest: Digest,
}

/// File hasher that skips re-reading files whose (mtime, size) are unchanged
#[derive(Debug, Default)]
pub struct ContentHasher {
    memo: Mutex<HashMap<PathBuf, MemoEntry>>,
}

impl ContentHasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a memo persisted by a previous run. A missing or unreadable memo
    /// yields an empty hasher.
    pub fn load(path: &Path) -> Self {
        let memo = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring corrupt hash memo {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            memo: Mutex::new(memo),
        }
    }

    /// Persist the memo for the next run
    pub fn save(&self, path: &Path) -> ManuResult<()> {
        let json = {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec(&*memo)?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ManuError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(path, json)
            .map_err(|e| ManuError::io(format!("writing hash memo {}", path.display()), e))
    }

    /// Hash a file, reusing the memoized digest when the file is unchanged
    pub fn hash_file(&self, path: &Path) -> ManuResult<Digest> {
        let stamp = FileStamp::of(path)
            .map_err(|e| ManuError::io(format!("reading metadata of {}", path.display()), e))?;

        {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = memo.get(path) {
                if entry.stamp == stamp {
                    return Ok(entry.digest);
                }
            }
        }

        let contents = fs::read(path)
            .map_err(|e| ManuError::io(format!("hashing {}", path.display()), e))?;
        let digest = Digest::of(&contents);
        debug!("Hashed {} -> {}", path.display(), digest.short());

        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), MemoEntry { stamp, digest });
        Ok(digest)
    }

    /// Forget the memoized digest of a file
    pub fn invalidate(&self, path: &Path) {
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }
}
