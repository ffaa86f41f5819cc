//! Packs the upload set and its metadata into one tar file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};
use crate::services::metadata::MetadataBundle;
use crate::services::progress::ProgressReporter;
use crate::utils::validation::{sanitize_marker_name, validate_bundle_path};

/// Name of the metadata entry at the start of every bundle
pub const METADATA_ENTRY: &str = "metadata.txt";

/// A bundle written to local disk
#[derive(Debug, Clone)]
pub struct BundleArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub file_count: usize,
}

impl BundleArtifact {
    pub async fn remove(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| ArchiveError::io(&self.path, e))
    }
}

pub struct Bundler;

impl Bundler {
    /// Writes `metadata.txt` and every listed file into a new tar in
    /// `work_dir`. The tar is not deleted automatically.
    pub async fn create(
        metadata: &MetadataBundle,
        work_dir: &Path,
        progress: &ProgressReporter,
    ) -> Result<BundleArtifact> {
        let metadata = metadata.clone();
        let work_dir = work_dir.to_path_buf();
        let progress = progress.clone();

        tokio::task::spawn_blocking(move || write_bundle(&metadata, &work_dir, &progress))
            .await
            .map_err(|e| {
                ArchiveError::io(
                    PathBuf::new(),
                    std::io::Error::other(format!("bundling task failed: {}", e)),
                )
            })?
    }
}

fn write_bundle(
    metadata: &MetadataBundle,
    work_dir: &Path,
    progress: &ProgressReporter,
) -> Result<BundleArtifact> {
    std::fs::create_dir_all(work_dir).map_err(|e| ArchiveError::io(work_dir, e))?;

    let (file, path) = tempfile::Builder::new()
        .prefix(&format!("{}_", sanitize_marker_name(&metadata.bundle_name)))
        .suffix(".tar")
        .tempfile_in(work_dir)
        .map_err(|e| ArchiveError::io(work_dir, e))?
        .keep()
        .map_err(|e| ArchiveError::io(work_dir, e.error))?;

    tracing::info!(
        "📦 Bundling {} files into {}",
        metadata.file.len(),
        path.display()
    );

    let result = append_entries(file, metadata, progress, &path);
    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result?;

    let size_bytes = std::fs::metadata(&path)
        .map_err(|e| ArchiveError::io(&path, e))?
        .len();

    Ok(BundleArtifact {
        path,
        size_bytes,
        file_count: metadata.file.len(),
    })
}

fn append_entries(
    file: File,
    metadata: &MetadataBundle,
    progress: &ProgressReporter,
    tar_path: &Path,
) -> Result<()> {
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(true);

    let json = metadata.to_json()?;
    let mut header = tar::Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(metadata.creation_date.max(0) as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, METADATA_ENTRY, json.as_bytes())
        .map_err(|e| ArchiveError::io(tar_path, e))?;

    let total = metadata.file.len();
    for (i, entry) in metadata.file.iter().enumerate() {
        validate_bundle_path(&entry.path)?;
        let local = Path::new(&entry.local_file_path);
        builder
            .append_path_with_name(local, &entry.path)
            .map_err(|e| ArchiveError::io(local, e))?;
        progress.bundling(i + 1, total);
    }

    builder
        .into_inner()
        .and_then(|mut w| std::io::Write::flush(&mut w))
        .map_err(|e| ArchiveError::io(tar_path, e))?;
    Ok(())
}
