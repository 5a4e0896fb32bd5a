//! # Snapshot Swap
//!
//! Blocking filesystem steps that replace a node's chain data with an
//! archive's contents. Run on the blocking pool.
//!
//! 1. Extract into `.snapshot-staging/` (gzip detected by magic bytes).
//! 2. Copy the node's identity (wallet, keystore, node key) into staging.
//! 3. Write `.snapshot-apply.journal`.
//! 4. Move live top-level entries to `.snapshot-previous/`, then staged
//!    entries into place.
//! 5. Remove the journal, then the previous tree and staging.
//!
//! Nothing live is touched before step 3. A journal that survives a crash
//! marks the directory as half-applied.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use shared_types::DataLayout;
use tracing::{debug, info};

use crate::domain::SnapshotError;
use crate::ports::SnapshotApplier;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Replace the chain data under `root` with the contents of `archive`.
pub fn apply_archive(root: &Path, archive: &Path) -> Result<(), SnapshotError> {
    let layout = DataLayout::new(root);
    let staging = layout.snapshot_staging();
    remove_if_exists(&staging)?;
    fs::create_dir_all(&staging).map_err(|e| SnapshotError::io("create staging", e))?;

    let prepared = extract(archive, &staging).and_then(|()| carry_identity(root, &staging));
    if let Err(err) = prepared {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    swap(&layout, &staging)?;
    info!(root = %root.display(), "snapshot applied");
    Ok(())
}

/// The journaled tar swap above.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarApplier;

impl SnapshotApplier for TarApplier {
    fn apply(&self, root: &Path, archive: &Path) -> Result<(), SnapshotError> {
        apply_archive(root, archive)
    }
}

fn extract(archive: &Path, staging: &Path) -> Result<(), SnapshotError> {
    let file = File::open(archive).map_err(|e| SnapshotError::io("open archive", e))?;
    let mut reader = BufReader::new(file);
    let gzipped = reader
        .fill_buf()
        .map_err(|e| SnapshotError::io("read archive", e))?
        .starts_with(&GZIP_MAGIC);

    let unpacked = if gzipped {
        tar::Archive::new(GzDecoder::new(reader)).unpack(staging)
    } else {
        tar::Archive::new(reader).unpack(staging)
    };
    unpacked.map_err(|e| SnapshotError::Archive(e.to_string()))?;

    let has_entries = fs::read_dir(staging)
        .map_err(|e| SnapshotError::io("list staging", e))?
        .filter_map(Result::ok)
        .any(|entry| !DataLayout::is_reserved_entry(&entry.file_name().to_string_lossy()));
    if !has_entries {
        return Err(SnapshotError::Archive("archive has no data entries".into()));
    }
    debug!(gzipped, staging = %staging.display(), "archive extracted");
    Ok(())
}

/// Identity material always comes from the live tree.
fn carry_identity(root: &Path, staging: &Path) -> Result<(), SnapshotError> {
    for entry in DataLayout::identity_entries() {
        let src = root.join(entry);
        if fs::symlink_metadata(&src).is_err() {
            continue;
        }
        let dst = staging.join(entry);
        remove_if_exists(&dst)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::io("create identity dir", e))?;
        }
        copy_recursive(&src, &dst)?;
    }
    Ok(())
}

fn swap(layout: &DataLayout, staging: &Path) -> Result<(), SnapshotError> {
    let root = layout.root();
    let journal = layout.snapshot_journal();
    let previous = layout.snapshot_previous();

    let mut marker = File::create(&journal).map_err(|e| SnapshotError::io("write journal", e))?;
    marker
        .write_all(b"applying\n")
        .and_then(|()| marker.sync_all())
        .map_err(|e| SnapshotError::io("write journal", e))?;

    remove_if_exists(&previous)?;
    fs::create_dir(&previous).map_err(|e| SnapshotError::io("create previous", e))?;

    for name in data_entries(root)? {
        fs::rename(root.join(&name), previous.join(&name))
            .map_err(|e| SnapshotError::io(format!("move aside {name}"), e))?;
    }
    for name in data_entries(staging)? {
        fs::rename(staging.join(&name), root.join(&name))
            .map_err(|e| SnapshotError::io(format!("move in {name}"), e))?;
    }

    fs::remove_file(&journal).map_err(|e| SnapshotError::io("remove journal", e))?;
    remove_if_exists(&previous)?;
    remove_if_exists(staging)?;
    Ok(())
}

/// Non-reserved top-level entry names of `dir`.
fn data_entries(dir: &Path) -> Result<Vec<String>, SnapshotError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| SnapshotError::io("list directory", e))? {
        let entry = entry.map_err(|e| SnapshotError::io("list directory", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !DataLayout::is_reserved_entry(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

fn copy_recursive(src: &Path, dst: &Path) -> Result<(), SnapshotError> {
    let meta = fs::metadata(src).map_err(|e| SnapshotError::io("stat identity", e))?;
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(|e| SnapshotError::io("copy identity", e))?;
        for entry in fs::read_dir(src).map_err(|e| SnapshotError::io("copy identity", e))? {
            let entry = entry.map_err(|e| SnapshotError::io("copy identity", e))?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst).map_err(|e| SnapshotError::io("copy identity", e))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), SnapshotError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return Ok(()),
    };
    result.map_err(|e| SnapshotError::io(format!("remove {}", path.display()), e))
}

/// What start-up recovery found in one data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// A swap was interrupted. The directory is left exactly as found.
    pub corrupt: bool,
    /// Leftovers of interrupted downloads that were deleted.
    pub cleaned: Vec<PathBuf>,
}

/// Inspect `root` after a restart.
pub fn recover_data_path(root: &Path) -> Result<Recovery, SnapshotError> {
    let layout = DataLayout::new(root);
    if layout.snapshot_journal().exists() {
        return Ok(Recovery {
            corrupt: true,
            cleaned: Vec::new(),
        });
    }

    let mut cleaned = Vec::new();
    for leftover in [
        layout.snapshot_partial(),
        layout.snapshot_staging(),
        layout.snapshot_previous(),
    ] {
        if fs::symlink_metadata(&leftover).is_ok() {
            remove_if_exists(&leftover)?;
            cleaned.push(leftover);
        }
    }
    Ok(Recovery {
        corrupt: false,
        cleaned,
    })
}
