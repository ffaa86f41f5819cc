//! One archive run for one dataset: scan, compare, describe, upload.

use std::sync::Arc;

use crate::config::{ArchiveConfig, JobParams};
use crate::error::{ArchiveError, Result};
use crate::infrastructure::http::setup_http_client;
use crate::models::{DiffResult, RunOutcome, UploadState};
use crate::services::differ::diff_against_archive;
use crate::services::metadata::{DatasetIdentity, MetadataBuilder, MetadataBundle};
use crate::services::progress::ProgressReporter;
use crate::services::remote_index::{
    CatalogIndexReader, DatasetAddress, RemoteIndexSource, read_index_or_empty,
};
use crate::services::scanner::DatasetScanner;
use crate::services::transport::{ArchiveTransport, HttpArchiveTransport};
use crate::services::uploader::UploadOrchestrator;

/// What a run would upload
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub files_scanned: usize,
    pub diff: DiffResult,
    pub metadata: MetadataBundle,
}

pub struct ArchiveSync {
    config: ArchiveConfig,
    index: Arc<dyn RemoteIndexSource>,
    transport: Arc<dyn ArchiveTransport>,
    ignore_case: bool,
}

impl ArchiveSync {
    pub fn new(
        config: ArchiveConfig,
        index: Arc<dyn RemoteIndexSource>,
        transport: Arc<dyn ArchiveTransport>,
    ) -> Self {
        Self {
            config,
            index,
            transport,
            ignore_case: true,
        }
    }

    /// Talks to the hosts named in `config`
    pub fn over_http(config: ArchiveConfig) -> Result<Self> {
        let client = setup_http_client(&config)?;
        let index = Arc::new(CatalogIndexReader::new(client.clone(), config.clone()));
        let transport = Arc::new(HttpArchiveTransport::new(client, config.clone()));
        Ok(Self::new(config, index, transport))
    }

    /// Compare archive paths without regard to case (on by default)
    pub fn ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    pub fn transport(&self) -> &dyn ArchiveTransport {
        self.transport.as_ref()
    }

    /// Scans the dataset and works out what the archive is missing.
    /// Makes no changes anywhere.
    pub async fn plan(&self, job: &JobParams, progress: &ProgressReporter) -> Result<SyncPlan> {
        let scanner = DatasetScanner::new(job.dataset_directory())
            .restrict_to(job.output_folder.as_deref())
            .recursive(job.recurse)
            .max_file_count(self.config.max_file_count);

        tracing::info!(
            "🔍 Scanning {} for dataset {}",
            scanner.scan_root().display(),
            job.dataset_key()
        );
        let local = scanner.scan(progress).await?;

        let address = DatasetAddress {
            dataset_id: job.dataset_id,
            sub_folder: job.output_folder.clone(),
        };
        let remote = read_index_or_empty(self.index.as_ref(), &address, self.ignore_case).await;
        let diff = diff_against_archive(&local, &remote, self.ignore_case);

        tracing::info!(
            "🧮 {} files scanned: {} new, {} updated, {} bytes to upload",
            local.len(),
            diff.count_new,
            diff.count_updated,
            diff.total_bytes_to_upload
        );

        let metadata = MetadataBuilder::build(
            &diff,
            &DatasetIdentity::from(job),
            job.output_folder.as_deref(),
        );

        Ok(SyncPlan {
            files_scanned: local.len(),
            diff,
            metadata,
        })
    }

    /// Runs the whole pipeline. Only an archive-verified upload, or having
    /// nothing to upload, counts as success.
    pub async fn run(&self, job: &JobParams, progress: &ProgressReporter) -> RunOutcome {
        let dataset = job.dataset_key();

        let plan = match self.plan(job, progress).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("❌ Could not prepare {}: {}", dataset, e);
                return failed_before_upload(dataset, e);
            }
        };

        let orchestrator =
            UploadOrchestrator::new(self.transport.clone(), &self.config, job.work_dir.clone());
        let report = orchestrator.upload(&dataset, &plan.metadata, progress).await;

        RunOutcome {
            dataset,
            state: report.session.state,
            files_scanned: plan.files_scanned,
            count_new: plan.diff.count_new,
            count_updated: plan.diff.count_updated,
            bytes_to_upload: plan.diff.total_bytes_to_upload,
            bytes_sent: report.session.bytes_sent,
            status_uri: report.session.status_uri,
            retained_bundle: report.retained_bundle,
            failure_class: report.error.as_ref().map(ArchiveError::classification),
            error: report.error.map(|e| e.to_string()),
        }
    }
}

fn failed_before_upload(dataset: String, error: ArchiveError) -> RunOutcome {
    RunOutcome {
        dataset,
        state: UploadState::Failed,
        files_scanned: 0,
        count_new: 0,
        count_updated: 0,
        bytes_to_upload: 0,
        bytes_sent: 0,
        status_uri: None,
        retained_bundle: None,
        failure_class: Some(error.classification()),
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::models::RemoteFileRecord;
    use crate::services::bundler::BundleArtifact;
    use crate::services::remote_index::NoRemoteIndex;
    use crate::services::transport::{IngestState, IngestStatus};
    use crate::utils::hash::calculate_sha1;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FixedIndex(Vec<RemoteFileRecord>);

    #[async_trait]
    impl RemoteIndexSource for FixedIndex {
        async fn fetch(&self, _address: &DatasetAddress) -> Result<Vec<RemoteFileRecord>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct InstantArchive {
        submits: AtomicUsize,
    }

    #[async_trait]
    impl ArchiveTransport for InstantArchive {
        async fn submit(&self, _bundle: &BundleArtifact, _p: &ProgressReporter) -> Result<String> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok("https://ingest.test/status/9".to_string())
        }

        async fn check_status(&self, _uri: &str) -> Result<IngestStatus> {
            Ok(IngestStatus {
                state: IngestState::Verified,
                percent: 100.0,
                message: "verified".to_string(),
                transaction_id: Some("9".to_string()),
            })
        }
    }

    fn job(root: &TempDir, work: &TempDir) -> JobParams {
        let task: HashMap<String, String> = [
            ("Job", "5001"),
            ("Dataset", "QC_Shew_24_01"),
            ("Dataset_ID", "998877"),
            ("Folder", "QC_Shew_24_01"),
            ("Storage_Vol", root.path().to_str().unwrap()),
            ("Storage_Path", "Lumos01/2024_2"),
            ("Instrument_Name", "Lumos01"),
            ("MyEMSL_Recurse", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let manager: HashMap<String, String> =
            [("workdir".to_string(), work.path().to_string_lossy().into_owned())].into();
        JobParams::from_maps(&task, &manager).unwrap()
    }

    fn write_dataset(root: &TempDir) {
        let dir = root.path().join("Lumos01/2024_2/QC_Shew_24_01");
        std::fs::create_dir_all(dir.join("QC")).unwrap();
        std::fs::write(dir.join("run.raw"), "raw").unwrap();
        std::fs::write(dir.join("QC/tic.png"), "png").unwrap();
    }

    fn config(locks: &TempDir) -> ArchiveConfig {
        ArchiveConfig {
            lock_dir: locks.path().to_path_buf(),
            ..ArchiveConfig::default()
        }
    }

    #[tokio::test]
    async fn test_plan_skips_archived_files() {
        let (root, work, locks) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        write_dataset(&root);
        let index = FixedIndex(vec![RemoteFileRecord {
            relative_path: "run.raw".to_string(),
            content_digest: calculate_sha1(b"raw"),
        }]);
        let sync = ArchiveSync::new(config(&locks), Arc::new(index), Arc::new(InstantArchive::default()));

        let plan = sync.plan(&job(&root, &work), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(plan.files_scanned, 2);
        assert_eq!(plan.diff.count_new, 1);
        assert_eq!(plan.metadata.file.len(), 1);
        assert_eq!(plan.metadata.file[0].path, "data/QC/tic.png");
        assert_eq!(plan.metadata.bundle_name, "QC_Shew_24_01_998877");
    }

    #[tokio::test]
    async fn test_plan_matches_archive_paths_case_insensitively_by_default() {
        let (root, work, locks) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        write_dataset(&root);
        let index = FixedIndex(vec![
            RemoteFileRecord {
                relative_path: "RUN.raw".to_string(),
                content_digest: calculate_sha1(b"raw"),
            },
            RemoteFileRecord {
                relative_path: "qc/TIC.png".to_string(),
                content_digest: calculate_sha1(b"png"),
            },
        ]);
        let sync = ArchiveSync::new(config(&locks), Arc::new(index), Arc::new(InstantArchive::default()));

        let plan = sync.plan(&job(&root, &work), &ProgressReporter::disabled()).await.unwrap();
        assert_eq!(plan.diff.count_new + plan.diff.count_updated, 0);

        let strict = sync.ignore_case(false);
        let plan = strict.plan(&job(&root, &work), &ProgressReporter::disabled()).await.unwrap();
        assert_eq!(plan.diff.count_new, 2);
    }

    #[tokio::test]
    async fn test_run_reports_verified_outcome() {
        let (root, work, locks) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        write_dataset(&root);
        let archive = Arc::new(InstantArchive::default());
        let sync = ArchiveSync::new(config(&locks), Arc::new(NoRemoteIndex), archive.clone());

        let outcome = sync.run(&job(&root, &work), &ProgressReporter::disabled()).await;

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.count_new, 2);
        assert_eq!(outcome.bytes_to_upload, 6);
        assert_eq!(outcome.status_uri.as_deref(), Some("https://ingest.test/status/9"));
        assert_eq!(archive.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_dataset_directory_is_configuration_failure() {
        let (root, work, locks) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let sync = ArchiveSync::new(
            config(&locks),
            Arc::new(NoRemoteIndex),
            Arc::new(InstantArchive::default()),
        );

        let outcome = sync.run(&job(&root, &work), &ProgressReporter::disabled()).await;

        assert_eq!(outcome.state, UploadState::Failed);
        assert_eq!(outcome.failure_class, Some(FailureClass::Configuration));
        assert!(outcome.error.unwrap().contains("Directory not found"));
    }
}
