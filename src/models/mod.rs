use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::FailureClass;

/// One hashed file of the local dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    /// Directory relative to the dataset folder, `/`-separated, empty at the top
    pub relative_directory: String,
    pub file_name: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-1
    pub content_digest: String,
    pub creation_timestamp: DateTime<Utc>,
    pub absolute_path: PathBuf,
}

impl LocalFileRecord {
    /// Path of the file inside the dataset, without a leading separator
    pub fn item_address(&self) -> String {
        if self.relative_directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.relative_directory, self.file_name)
        }
    }
}

/// A file the archive already holds for this dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    pub relative_path: String,
    pub content_digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub new_files: Vec<LocalFileRecord>,
    pub updated_files: Vec<LocalFileRecord>,
    pub total_bytes_to_upload: u64,
    pub count_new: usize,
    pub count_updated: usize,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.updated_files.is_empty()
    }

    /// New files followed by updated files
    pub fn upload_set(&self) -> impl Iterator<Item = &LocalFileRecord> {
        self.new_files.iter().chain(self.updated_files.iter())
    }
}

/// Upload lifecycle; `Verified` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    MetadataReady,
    Bundling,
    Submitting,
    AwaitingVerification,
    Verified,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Verified | UploadState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub status_uri: Option<String>,
    pub bytes_total: u64,
    pub bytes_sent: u64,
    pub state: UploadState,
}

impl UploadSession {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            status_uri: None,
            bytes_total,
            bytes_sent: 0,
            state: UploadState::Idle,
        }
    }
}

/// Part of the run a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Hashing,
    Bundling,
    Uploading,
    Verifying,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Overall progress across every phase, 0 to 100
    pub percent: f32,
    pub message: String,
    pub bytes_sent: Option<u64>,
    pub bytes_total: Option<u64>,
}

/// What a run reports back to the job host
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub dataset: String,
    pub state: UploadState,
    pub files_scanned: usize,
    pub count_new: usize,
    pub count_updated: usize,
    pub bytes_to_upload: u64,
    pub bytes_sent: u64,
    pub status_uri: Option<String>,
    /// Bundle left on disk after a failed upload
    pub retained_bundle: Option<PathBuf>,
    pub error: Option<String>,
    pub failure_class: Option<FailureClass>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == UploadState::Verified
    }
}
