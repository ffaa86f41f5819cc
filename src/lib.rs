pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{ArchiveConfig, JobParams, Perspective};
pub use error::{ArchiveError, FailureClass, Result};
pub use models::{ProgressEvent, RunOutcome, UploadState};
pub use services::archive_sync::{ArchiveSync, SyncPlan};
pub use services::progress::ProgressReporter;
