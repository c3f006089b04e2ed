//! Cache entry metadata

use crate::cache::hasher::{CacheKey, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One output blob recorded in an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    /// Output path relative to the project root
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

/// Metadata written alongside the output blobs of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: CacheKey,

    /// Id of the rule that produced the entry
    pub rule: String,

    pub created_at: DateTime<Utc>,

    /// Total size of the output blobs
    pub size: u64,

    /// Outputs in rule declaration order
    pub outputs: Vec<CachedOutput>,
}

impl EntryMeta {
    pub fn new(key: CacheKey, rule: impl Into<String>, outputs: Vec<CachedOutput>) -> Self {
        Self {
            key,
            rule: rule.into(),
            created_at: Utc::now(),
            size: outputs.iter().map(|o| o.size).sum(),
            outputs,
        }
    }

    /// Digest recorded for an output path
    pub fn digest_of(&self, path: &std::path::Path) -> Option<Digest> {
        self.outputs
            .iter()
            .find(|o| o.path == path)
            .map(|o| o.digest)
    }
}

/// Where an entry's blobs currently live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tier {
    /// Blobs are in the local cache directory
    Local,
    /// Only metadata is local; blobs are in this remote deposit
    Remote { deposit: String },
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote { deposit } => write!(f, "remote:{}", deposit),
        }
    }
}

/// A cache entry as seen by a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub tier: Tier,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        self.meta.key
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024 * 3), "3.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024 * 2), "2.0 GB");
    }

    #[test]
    fn meta_sums_sizes_and_finds_digests() {
        let key = CacheKey::derive("spec", &[]);
        let fig = Digest::of(b"fig");
        let meta = EntryMeta::new(
            key,
            "fig1",
            vec![
                CachedOutput {
                    path: PathBuf::from("figures/fig1.pdf"),
                    digest: fig,
                    size: 10,
                },
                CachedOutput {
                    path: PathBuf::from("figures/fig1.png"),
                    digest: Digest::of(b"png"),
                    size: 5,
                },
            ],
        );
        assert_eq!(meta.size, 15);
        assert_eq!(meta.digest_of(Path::new("figures/fig1.pdf")), Some(fig));
        assert_eq!(meta.digest_of(Path::new("missing")), None);

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: EntryMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn tier_display() {
        assert_eq!(Tier::Local.to_string(), "local");
        assert_eq!(
            Tier::Remote {
                deposit: "123".to_string()
            }
            .to_string(),
            "remote:123"
        );
    }
}
