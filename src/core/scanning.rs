//! Source tree scanning
//!
//! This module provides the two views of a source directory the image builder
//! needs: a recursive pre-scan for totals and an ordered single-level listing
//! for the depth-first walk. Both classify entries the same way, so the walk
//! never reports more files than the pre-scan saw on an unchanged tree.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{DiscError, Result};

/// How an entry of the source tree is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    /// Regular file (or symlink to one) with its size in bytes
    File(u64),
    /// Anything else: sockets, dangling links, links to directories
    Skipped,
}

/// Classify a path without following directory symlinks
pub fn classify(path: &Path, file_type: fs::FileType) -> Result<EntryKind> {
    if file_type.is_dir() {
        return Ok(EntryKind::Directory);
    }
    if file_type.is_file() {
        let len = fs::metadata(path)
            .map_err(|e| DiscError::from_io_at(e, path))?
            .len();
        return Ok(EntryKind::File(len));
    }
    if file_type.is_symlink() {
        // Links to files are stored as files; directory links are not followed
        return match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(EntryKind::File(meta.len())),
            Ok(_) => {
                log::warn!("Not following directory link {}", path.display());
                Ok(EntryKind::Skipped)
            }
            Err(_) => {
                log::warn!("Skipping dangling link {}", path.display());
                Ok(EntryKind::Skipped)
            }
        };
    }
    Ok(EntryKind::Skipped)
}

/// Totals gathered before a build starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Recursively count files and bytes under `root`
pub fn scan_source_tree(root: &Path) -> Result<SourceSummary> {
    let mut summary = SourceSummary::default();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            match e.into_io_error() {
                Some(io) => DiscError::from_io_at(io, &path),
                None => DiscError::InvalidArgument(format!(
                    "Filesystem loop at {}",
                    path.display()
                )),
            }
        })?;

        if let EntryKind::File(len) = classify(entry.path(), entry.file_type())? {
            summary.total_files += 1;
            summary.total_bytes += len;
        }
    }

    Ok(summary)
}

/// One level of a directory, split into subdirectories and files
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub directories: Vec<PathBuf>,
    pub files: Vec<(PathBuf, u64)>,
}

/// List a directory with entries sorted by name for a stable walk order
pub fn list_directory(dir: &Path) -> Result<DirectoryListing> {
    let mut listing = DirectoryListing::default();

    let entries = fs::read_dir(dir).map_err(|e| DiscError::from_io_at(e, dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| DiscError::from_io_at(e, dir))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| DiscError::from_io_at(e, &path))?;

        match classify(&path, file_type)? {
            EntryKind::Directory => listing.directories.push(path),
            EntryKind::File(len) => listing.files.push((path, len)),
            EntryKind::Skipped => {}
        }
    }

    listing.directories.sort();
    listing.files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(listing)
}
