//! External datasets
//!
//! Datasets are declared in config under `[datasets.<deposit id>]` and
//! materialized before the build graph is evaluated; their files become leaf
//! inputs of the rules that read them.

pub mod manifest;
pub mod materialize;

pub use manifest::{ArchiveKind, ContentsNode, DatasetEntry, PinnedFile};
pub use materialize::{DatasetMaterializer, MaterializedDataset};
