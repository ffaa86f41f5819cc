//! Dataset scanning and SHA-1 hashing.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::models::LocalFileRecord;
use crate::services::progress::ProgressReporter;
use crate::utils::hash::calculate_sha1_for_file;

/// Archives are shipped as a single tar, so very large file counts are refused.
pub const DEFAULT_MAX_FILE_COUNT: usize = 500_000;

/// Walks one dataset folder and hashes every file in it
#[derive(Debug, Clone)]
pub struct DatasetScanner {
    /// Dataset folder; record paths are relative to this
    base_dir: PathBuf,
    /// Folder actually walked, `base_dir` or a folder below it
    scan_root: PathBuf,
    recurse: bool,
    max_file_count: usize,
}

struct PendingFile {
    path: PathBuf,
    metadata: std::fs::Metadata,
}

impl DatasetScanner {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            scan_root: base_dir.clone(),
            base_dir,
            recurse: true,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }
    }

    /// Only scan `sub_folder`, still reporting paths relative to the dataset
    #[must_use]
    pub fn restrict_to(mut self, sub_folder: Option<&str>) -> Self {
        self.scan_root = match sub_folder {
            Some(sub) if !sub.is_empty() => self.base_dir.join(sub),
            _ => self.base_dir.clone(),
        };
        self
    }

    #[must_use]
    pub fn recursive(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    #[must_use]
    pub fn max_file_count(mut self, limit: usize) -> Self {
        self.max_file_count = limit;
        self
    }

    pub fn scan_root(&self) -> &Path {
        &self.scan_root
    }

    /// Lists the files to hash, failing before any hashing happens when
    /// the folder is missing or holds too many files.
    fn enumerate(&self) -> Result<Vec<PendingFile>> {
        if !self.scan_root.is_dir() {
            return Err(ArchiveError::DirectoryNotFound(self.scan_root.clone()));
        }

        let max_depth = if self.recurse { usize::MAX } else { 1 };
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.scan_root)
            .follow_links(true)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.scan_root.clone());
                ArchiveError::io(path, e.into())
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| ArchiveError::io(entry.path(), e.into()))?;
            files.push(PendingFile {
                path: entry.into_path(),
                metadata,
            });

            if files.len() > self.max_file_count {
                return Err(ArchiveError::CountExceeded {
                    count: files.len(),
                    limit: self.max_file_count,
                });
            }
        }

        Ok(files)
    }

    /// Hashes every file below the scan root.
    ///
    /// # Errors
    /// `DirectoryNotFound` when the scan root is missing, `CountExceeded`
    /// when it holds more files than allowed, `Io` when a file cannot be read.
    pub async fn scan(&self, progress: &ProgressReporter) -> Result<Vec<LocalFileRecord>> {
        let pending = self.enumerate()?;
        let bytes_total: u64 = pending.iter().map(|f| f.metadata.len()).sum();

        tracing::info!(
            "🔍 Hashing {} files ({} bytes) under {}",
            pending.len(),
            bytes_total,
            self.scan_root.display()
        );

        let mut records = Vec::with_capacity(pending.len());
        let mut bytes_hashed = 0u64;

        for file in pending {
            let record = self.hash_file(file).await?;
            bytes_hashed += record.size_bytes;
            progress.hashing(bytes_hashed, bytes_total, &record.file_name);
            records.push(record);
        }

        if records.is_empty() {
            progress.hashing(0, 0, "no files");
        }

        records.sort_by_key(|r| r.item_address());
        Ok(records)
    }

    async fn hash_file(&self, file: PendingFile) -> Result<LocalFileRecord> {
        let relative = file.path.strip_prefix(&self.base_dir).map_err(|_| {
            ArchiveError::InvalidParameter {
                name: "path".to_string(),
                reason: format!(
                    "{} is outside {}",
                    file.path.display(),
                    self.base_dir.display()
                ),
            }
        })?;

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative_directory = relative
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        let (content_digest, size_bytes) = calculate_sha1_for_file(&file.path).await?;

        let created = file
            .metadata
            .created()
            .or_else(|_| file.metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        tracing::debug!("Hashed {} -> {}", relative.display(), content_digest);

        Ok(LocalFileRecord {
            relative_directory,
            file_name,
            size_bytes,
            content_digest,
            creation_timestamp: created,
            absolute_path: file.path,
        })
    }
}
