//! Dataset declarations
//!
//! A dataset names files stored in a remote archive deposit and where they
//! land locally:
//!
//! ```toml
//! [datasets."10.5281/zenodo.6468327"]
//! destination = "src/data"
//!
//! [datasets."10.5281/zenodo.6468327".contents]
//! "TOI640b.json" = "src/data/TOI640b.json"
//! "raw.csv" = { path = "src/data/raw.csv", sha256 = "9f86d0..." }
//!
//! [datasets."10.5281/zenodo.6468327".contents."images.tar.gz"]
//! "README.md" = ""
//! "images" = { "fig1.png" = "src/data/fig1.png" }
//! ```
//!
//! Inside an archive, tables are subfolders, except that a table whose key
//! is itself an archive name is extracted as a nested archive.
//!
//! A table holding exactly `sha256` and optionally `path` is always a pinned
//! file. A subfolder whose only members are named `path` and `sha256`
//! cannot be declared; any other key in the table makes it a subfolder.

use crate::cache::Digest;
use crate::error::{ManuError, ManuResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default destination for dataset files, relative to the project root
pub const DEFAULT_DESTINATION: &str = "src/data";

/// One declared dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Directory that receives files declared with an empty local path
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Remote file name -> local path, pinned file or archive tree
    #[serde(default)]
    pub contents: BTreeMap<String, ContentsNode>,
}

fn default_destination() -> PathBuf {
    PathBuf::from(DEFAULT_DESTINATION)
}

/// A node of the contents tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentsNode {
    /// Local path; empty means `destination/<name>`
    Path(String),

    /// Local path with an expected content hash
    Pinned(PinnedFile),

    /// Archive members or subfolder entries. Tried after `Pinned`.
    Tree(BTreeMap<String, ContentsNode>),
}

/// File with a pinned SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinnedFile {
    #[serde(default)]
    pub path: String,
    pub sha256: String,
}

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
}

impl ArchiveKind {
    /// Detect the archive format from a file name
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Where a target file comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A file stored directly in the deposit
    Remote { name: String },

    /// A member of an archive in the deposit.
    ///
    /// `chain[0]` is the deposit file; each later element is a nested
    /// archive member of the previous one.
    Member { chain: Vec<String>, member: String },
}

impl Source {
    /// Deposit file that must be fetched to produce this target
    pub fn remote_name(&self) -> &str {
        match self {
            Self::Remote { name } => name,
            Self::Member { chain, .. } => chain.first().map(String::as_str).unwrap_or_default(),
        }
    }

    /// Human-readable location, e.g. `images.tar.gz/images/fig1.png`
    pub fn display_name(&self) -> String {
        match self {
            Self::Remote { name } => name.clone(),
            Self::Member { chain, member } => {
                let mut parts = chain.clone();
                parts.push(member.clone());
                parts.join("/")
            }
        }
    }
}

/// One local file a dataset must produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub source: Source,
    pub local: PathBuf,
    pub sha256: Option<Digest>,
}

impl DatasetEntry {
    /// Flatten the contents tree into the list of files to produce.
    ///
    /// Local paths are resolved against `root`.
    pub fn targets(&self, root: &Path) -> ManuResult<Vec<Target>> {
        let destination = root.join(&self.destination);
        let mut targets = Vec::new();

        for (name, node) in &self.contents {
            match node {
                ContentsNode::Tree(tree) => {
                    if ArchiveKind::detect(name).is_none() {
                        return Err(ManuError::Archive {
                            name: name.clone(),
                            reason: "only .tar.gz, .tgz and .tar files can declare members"
                                .to_string(),
                        });
                    }
                    collect_members(
                        tree,
                        vec![name.clone()],
                        "",
                        root,
                        &destination,
                        &mut targets,
                    )?;
                }
                leaf => {
                    let (local, sha256) = resolve_leaf(leaf, name, root, &destination)?;
                    targets.push(Target {
                        source: Source::Remote { name: name.clone() },
                        local,
                        sha256,
                    });
                }
            }
        }

        Ok(targets)
    }
}

fn collect_members(
    tree: &BTreeMap<String, ContentsNode>,
    chain: Vec<String>,
    prefix: &str,
    root: &Path,
    destination: &Path,
    targets: &mut Vec<Target>,
) -> ManuResult<()> {
    for (key, node) in tree {
        let member = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}/{}", prefix, key)
        };

        match node {
            ContentsNode::Tree(subtree) if ArchiveKind::detect(key).is_some() => {
                let mut nested = chain.clone();
                nested.push(member);
                collect_members(subtree, nested, "", root, destination, targets)?;
            }
            ContentsNode::Tree(subtree) => {
                collect_members(subtree, chain.clone(), &member, root, destination, targets)?;
            }
            leaf => {
                let (local, sha256) = resolve_leaf(leaf, &member, root, destination)?;
                targets.push(Target {
                    source: Source::Member {
                        chain: chain.clone(),
                        member,
                    },
                    local,
                    sha256,
                });
            }
        }
    }
    Ok(())
}

fn resolve_leaf(
    node: &ContentsNode,
    name: &str,
    root: &Path,
    destination: &Path,
) -> ManuResult<(PathBuf, Option<Digest>)> {
    let (path, sha256) = match node {
        ContentsNode::Path(path) => (path.as_str(), None),
        ContentsNode::Pinned(pinned) => {
            let digest = Digest::from_hex(&pinned.sha256).ok_or_else(|| {
                ManuError::User(format!("invalid sha256 for {}: {}", name, pinned.sha256))
            })?;
            (pinned.path.as_str(), Some(digest))
        }
        ContentsNode::Tree(_) => {
            return Err(ManuError::Internal(format!("{} is not a file entry", name)))
        }
    };

    let local = if path.is_empty() {
        destination.join(name)
    } else {
        root.join(path)
    };
    Ok((local, sha256))
}
