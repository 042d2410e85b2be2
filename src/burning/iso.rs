//! ISO image creation from a directory tree
//!
//! Walks the source depth-first (each directory registered before its files,
//! subdirectories before files at every level), projects every path onto the
//! uppercase primary tree and serializes the result with a Joliet volume.

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::iso9660::{ImagePath, IsoImage};
use crate::core::{BuildProgress, CancelToken, list_directory, scan_source_tree};
use crate::error::{DiscError, Result};

/// Label used when the requested one is blank
pub const DEFAULT_VOLUME_LABEL: &str = "DATA";

/// Longest volume identifier the primary descriptor holds
pub const MAX_VOLUME_LABEL_LEN: usize = 32;

/// Result of ISO creation
#[derive(Debug, Clone)]
pub struct IsoResult {
    pub iso_path: PathBuf,
    pub volume_label: String,
    pub file_count: usize,
    pub total_bytes: u64,
    pub image_size: u64,
}

/// Normalize a volume label for the primary volume descriptor
///
/// Trims, falls back to `DATA` when blank, keeps the first 32 characters and
/// uppercases them. Characters outside printable ASCII become `_`.
pub fn normalize_volume_label(label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return DEFAULT_VOLUME_LABEL.to_string();
    }

    trimmed
        .chars()
        .take(MAX_VOLUME_LABEL_LEN)
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn modified_time(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

struct Walk<'a, F> {
    root: &'a Path,
    image: IsoImage,
    progress: BuildProgress,
    on_progress: F,
    cancel: &'a CancelToken,
}

impl<F: FnMut(&BuildProgress)> Walk<'_, F> {
    fn image_path(&self, path: &Path) -> Result<ImagePath> {
        let relative = path.strip_prefix(self.root).map_err(|_| {
            DiscError::InvalidArgument(format!("{} is outside the source tree", path.display()))
        })?;
        ImagePath::from_relative(relative)
    }

    fn add_directory_contents(&mut self, dir: &Path) -> Result<()> {
        self.cancel.check()?;
        let listing = list_directory(dir)?;

        for subdir in &listing.directories {
            let image_path = self.image_path(subdir)?;
            self.image.add_directory(&image_path, modified_time(subdir))?;
            self.add_directory_contents(subdir)?;
        }

        for (file, size) in &listing.files {
            self.cancel.check()?;
            let image_path = self.image_path(file)?;
            self.image.add_file(&image_path, file, *size, modified_time(file))?;

            self.progress.processed_files += 1;
            self.progress.processed_bytes += size;
            // Files created after the pre-scan still count toward the total
            self.progress.total_files = self.progress.total_files.max(self.progress.processed_files);
            self.progress.total_bytes = self.progress.total_bytes.max(self.progress.processed_bytes);
            self.progress.current_file_name = image_path.file_name().unwrap_or_default().to_string();

            log::debug!("Added {} ({} bytes)", image_path, size);
            (self.on_progress)(&self.progress);
        }

        Ok(())
    }
}

/// Create an ISO image of `source_dir` at `output_path`
///
/// # Arguments
/// * `source_dir` - Directory whose contents become the image root
/// * `output_path` - Image file to create; parent directories are created
/// * `volume_label` - Requested label, normalized with [`normalize_volume_label`]
/// * `on_progress` - Called once per file added
/// * `cancel` - Checked before each directory and each file
///
/// # Returns
/// * `Ok(IsoResult)` with the path to the created image
/// * `Err(DiscError::Cancelled)` if cancelled
///
/// Once the output file exists, any failure removes it again.
pub fn build_image<F>(
    source_dir: &Path,
    output_path: &Path,
    volume_label: &str,
    on_progress: F,
    cancel: &CancelToken,
) -> Result<IsoResult>
where
    F: FnMut(&BuildProgress),
{
    if source_dir.as_os_str().is_empty() {
        return Err(DiscError::InvalidArgument("Source directory is required".to_string()));
    }
    if !source_dir.is_dir() {
        return Err(DiscError::NotFound(format!(
            "Source directory not found: {}",
            source_dir.display()
        )));
    }
    if output_path.as_os_str().is_empty() {
        return Err(DiscError::InvalidArgument("Output path is required".to_string()));
    }

    let label = normalize_volume_label(volume_label);
    cancel.check()?;

    let summary = scan_source_tree(source_dir)?;
    log::info!(
        "Creating ISO from {} to {} with volume label '{}' ({} files, {} bytes)",
        source_dir.display(),
        output_path.display(),
        label,
        summary.total_files,
        summary.total_bytes
    );

    let mut walk = Walk {
        root: source_dir,
        image: IsoImage::new(&label),
        progress: BuildProgress {
            total_files: summary.total_files,
            total_bytes: summary.total_bytes,
            ..Default::default()
        },
        on_progress,
        cancel,
    };
    walk.add_directory_contents(source_dir)?;
    let image = walk.image;

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(output_path)?;
    let mut writer = BufWriter::new(file);
    let image_size = match image.write_to(&mut writer, cancel) {
        Ok(size) => size,
        Err(e) => {
            drop(writer);
            discard_partial(output_path);
            return Err(e);
        }
    };

    log::info!(
        "ISO created successfully at {} ({} bytes)",
        output_path.display(),
        image_size
    );

    Ok(IsoResult {
        iso_path: output_path.to_path_buf(),
        volume_label: label,
        file_count: image.file_count(),
        total_bytes: image.total_file_bytes(),
        image_size,
    })
}

fn discard_partial(output_path: &Path) {
    match fs::remove_file(output_path) {
        Ok(()) => log::info!("Removed partial image {}", output_path.display()),
        Err(e) => log::warn!(
            "Could not remove partial image {}: {}",
            output_path.display(),
            e
        ),
    }
}
