//! Tar archives for remote cache bundles and dataset extraction
//!
//! Bundles are deterministic: entries are sorted and headers carry no
//! mtime or ownership, so packing the same entry twice gives the same bytes.

use crate::dataset::ArchiveKind;
use crate::error::{ManuError, ManuResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Pack every regular file under `dir` into a gzip-compressed tarball
pub fn pack_dir(dir: &Path) -> ManuResult<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut builder = Builder::new(Vec::new());
    for rel in &files {
        let path = dir.join(rel);
        let file = File::open(&path)
            .map_err(|e| ManuError::io(format!("opening {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| ManuError::io(format!("reading metadata of {}", path.display()), e))?
            .len();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_size(len);
        builder
            .append_data(&mut header, rel, file)
            .map_err(|e| ManuError::io(format!("archiving {}", path.display()), e))?;
    }

    let tar_bytes = builder
        .into_inner()
        .map_err(|e| ManuError::io("finishing tar archive", e))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar_bytes)
        .map_err(|e| ManuError::io("compressing bundle", e))?;
    encoder
        .finish()
        .map_err(|e| ManuError::io("compressing bundle", e))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> ManuResult<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| ManuError::io(format!("listing {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ManuError::io(format!("listing {}", dir.display()), e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// Unpack a gzip-compressed tarball into `dest`
pub fn unpack_into(bytes: &[u8], dest: &Path) -> ManuResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| ManuError::io(format!("creating {}", dest.display()), e))?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive
        .unpack(dest)
        .map_err(|e| ManuError::io(format!("unpacking bundle into {}", dest.display()), e))
}

/// Read the named members out of an archive held in memory.
///
/// Only the requested members are read. A requested member missing from the
/// archive is absent from the returned map.
pub fn extract_members(
    bytes: &[u8],
    kind: ArchiveKind,
    wanted: &BTreeSet<String>,
) -> ManuResult<HashMap<String, Vec<u8>>> {
    match kind {
        ArchiveKind::TarGz => read_members(Archive::new(GzDecoder::new(bytes)), wanted),
        ArchiveKind::Tar => read_members(Archive::new(bytes), wanted),
    }
}

fn read_members<R: Read>(
    mut archive: Archive<R>,
    wanted: &BTreeSet<String>,
) -> ManuResult<HashMap<String, Vec<u8>>> {
    let mut found = HashMap::new();
    let entries = archive
        .entries()
        .map_err(|e| ManuError::io("reading archive entries", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ManuError::io("reading archive entry", e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = {
            let path = entry
                .path()
                .map_err(|e| ManuError::io("reading archive entry path", e))?;
            normalize_member(&path)
        };
        if !wanted.contains(&name) || found.contains_key(&name) {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| ManuError::io(format!("extracting {}", name), e))?;
        debug!("Extracted {} ({} bytes)", name, data.len());
        found.insert(name, data);

        if found.len() == wanted.len() {
            break;
        }
    }

    Ok(found)
}

/// `./images/a.png` and `images/a.png` name the same member
fn normalize_member(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
