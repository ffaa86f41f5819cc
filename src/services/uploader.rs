//! Drives one bundle from metadata to a verified archive copy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::models::{UploadSession, UploadState};
use crate::services::bundler::{BundleArtifact, Bundler};
use crate::services::lock::LockManager;
use crate::services::metadata::MetadataBundle;
use crate::services::progress::ProgressReporter;
use crate::services::transport::{ArchiveTransport, IngestState};

/// How an upload ended
#[derive(Debug)]
pub struct UploadReport {
    pub session: UploadSession,
    /// Bundle kept on disk because the upload did not verify
    pub retained_bundle: Option<PathBuf>,
    pub error: Option<ArchiveError>,
}

impl UploadReport {
    pub fn succeeded(&self) -> bool {
        self.session.state == UploadState::Verified
    }
}

pub struct UploadOrchestrator {
    transport: Arc<dyn ArchiveTransport>,
    locks: LockManager,
    work_dir: PathBuf,
    poll_interval: Duration,
    poll_limit: u32,
}

impl UploadOrchestrator {
    pub fn new(
        transport: Arc<dyn ArchiveTransport>,
        config: &ArchiveConfig,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            locks: LockManager::new(&config.lock_dir),
            work_dir: work_dir.into(),
            poll_interval: config.status_poll_interval,
            poll_limit: config.status_poll_limit.max(1),
        }
    }

    /// Uploads `metadata` and its files under the lock for `dataset_key`.
    ///
    /// Never returns early with an error: failures end in
    /// [`UploadState::Failed`] with the error kept in the report.
    pub async fn upload(
        &self,
        dataset_key: &str,
        metadata: &MetadataBundle,
        progress: &ProgressReporter,
    ) -> UploadReport {
        let mut session = UploadSession::new(metadata.total_bytes());
        transition(&mut session, UploadState::MetadataReady);

        if metadata.file.is_empty() {
            tracing::info!("✅ {} is already archived, nothing to upload", dataset_key);
            transition(&mut session, UploadState::Verified);
            progress.complete("Nothing to upload");
            return UploadReport {
                session,
                retained_bundle: None,
                error: None,
            };
        }

        let guard = match self.locks.acquire(dataset_key) {
            Ok(guard) => guard,
            Err(e) => return failed(session, None, e),
        };

        transition(&mut session, UploadState::Bundling);
        let bundle = match Bundler::create(metadata, &self.work_dir, progress).await {
            Ok(bundle) => bundle,
            Err(e) => return failed(session, None, e),
        };

        if let Err(e) = self.submit_and_verify(&mut session, &bundle, progress).await {
            tracing::warn!("Keeping bundle {} for inspection", bundle.path.display());
            return failed(session, Some(bundle.path), e);
        }

        if let Err(e) = bundle.remove().await {
            tracing::warn!("Verified, but could not delete bundle: {}", e);
        }
        if let Err(e) = guard.release() {
            tracing::warn!("Verified, but could not remove lock marker: {}", e);
        }
        transition(&mut session, UploadState::Verified);
        progress.complete("Archive verified the upload");
        tracing::info!("✅ {} verified by the archive", dataset_key);

        UploadReport {
            session,
            retained_bundle: None,
            error: None,
        }
    }

    async fn submit_and_verify(
        &self,
        session: &mut UploadSession,
        bundle: &BundleArtifact,
        progress: &ProgressReporter,
    ) -> Result<()> {
        transition(session, UploadState::Submitting);
        let status_uri = self.transport.submit(bundle, progress).await?;
        session.bytes_sent = bundle.size_bytes;
        session.status_uri = Some(status_uri.clone());
        tracing::info!(
            "📨 Accepted {} bytes ({} bytes of files), status at {}",
            session.bytes_sent,
            session.bytes_total,
            status_uri
        );

        transition(session, UploadState::AwaitingVerification);
        self.await_verification(&status_uri, progress).await
    }

    async fn await_verification(&self, status_uri: &str, progress: &ProgressReporter) -> Result<()> {
        for check in 1..=self.poll_limit {
            let status = self.transport.check_status(status_uri).await?;
            progress.verifying(status.percent, &status.message);

            match status.state {
                IngestState::Verified => return Ok(()),
                IngestState::Failed => return Err(ArchiveError::VerificationFailed(status.message)),
                IngestState::InProgress => {
                    tracing::debug!(
                        "Status check {}/{}: {:.0}% {}",
                        check,
                        self.poll_limit,
                        status.percent,
                        status.message
                    );
                    if check < self.poll_limit {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }
        Err(ArchiveError::VerificationTimeout(self.poll_limit))
    }
}

fn transition(session: &mut UploadSession, next: UploadState) {
    debug_assert!(!session.state.is_terminal(), "{:?} is terminal", session.state);
    tracing::debug!("Upload state {:?} -> {:?}", session.state, next);
    session.state = next;
}

fn failed(
    mut session: UploadSession,
    retained_bundle: Option<PathBuf>,
    error: ArchiveError,
) -> UploadReport {
    tracing::error!("❌ Upload failed in {:?}: {}", session.state, error);
    transition(&mut session, UploadState::Failed);
    UploadReport {
        session,
        retained_bundle,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::{EusInfo, FileEntry};
    use crate::services::progress;
    use crate::services::transport::IngestStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays canned status readings and records calls
    struct ScriptedTransport {
        submit_result: Mutex<Option<Result<String>>>,
        statuses: Mutex<Vec<IngestStatus>>,
        submits: Mutex<usize>,
        checks: Mutex<usize>,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<IngestStatus>) -> Self {
            Self {
                submit_result: Mutex::new(None),
                statuses: Mutex::new(statuses),
                submits: Mutex::new(0),
                checks: Mutex::new(0),
            }
        }

        fn rejecting(message: &str) -> Self {
            let t = Self::new(vec![]);
            *t.submit_result.lock().unwrap() =
                Some(Err(ArchiveError::SubmissionRejected(message.to_string())));
            t
        }
    }

    #[async_trait]
    impl ArchiveTransport for ScriptedTransport {
        async fn submit(&self, bundle: &BundleArtifact, progress: &ProgressReporter) -> Result<String> {
            *self.submits.lock().unwrap() += 1;
            assert!(bundle.path.exists());
            progress.uploading(bundle.size_bytes, bundle.size_bytes);
            match self.submit_result.lock().unwrap().take() {
                Some(result) => result,
                None => Ok("https://ingest.test/status/1".to_string()),
            }
        }

        async fn check_status(&self, _status_uri: &str) -> Result<IngestStatus> {
            *self.checks.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }
    }

    fn status(state: IngestState, percent: f32, message: &str) -> IngestStatus {
        IngestStatus {
            state,
            percent,
            message: message.to_string(),
            transaction_id: None,
        }
    }

    fn config(locks: &TempDir) -> ArchiveConfig {
        ArchiveConfig {
            lock_dir: locks.path().to_path_buf(),
            status_poll_interval: Duration::from_millis(1),
            status_poll_limit: 3,
            ..ArchiveConfig::default()
        }
    }

    fn metadata(src: &TempDir) -> MetadataBundle {
        let local = src.path().join("run.raw");
        std::fs::write(&local, "spectra").unwrap();
        MetadataBundle {
            bundle_name: "ds_7".to_string(),
            creation_date: 1_700_000_000,
            version: "1.2.0".to_string(),
            eus_info: EusInfo {
                instrument_id: "34127".to_string(),
                instrument_name: "Lumos01".to_string(),
                proposal_id: "17797".to_string(),
                groups: vec![],
            },
            file: vec![FileEntry {
                path: "data/run.raw".to_string(),
                sha1_hash: "00".repeat(20),
                size_in_bytes: 7,
                local_file_path: local.to_string_lossy().into_owned(),
                creation_date: 0,
                destination_directory: "data".to_string(),
                file_name: "run.raw".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_verified_upload_cleans_up() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![
            status(IngestState::InProgress, 50.0, "processing"),
            status(IngestState::Verified, 100.0, "verified"),
        ]));
        let orchestrator = UploadOrchestrator::new(transport.clone(), &config(&locks), work.path());
        let (reporter, mut rx) = progress::channel();

        let report = orchestrator.upload("ds_7", &metadata(&src), &reporter).await;

        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.session.status_uri.as_deref(), Some("https://ingest.test/status/1"));
        assert!(report.session.bytes_sent > 0);
        assert!(report.retained_bundle.is_none());
        assert_eq!(*transport.checks.lock().unwrap(), 2);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
        assert!(!LockManager::new(locks.path()).is_locked("ds_7"));

        let mut last = 0.0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.percent >= last);
            last = event.percent;
        }
        assert_eq!(last, 100.0);
    }

    #[tokio::test]
    async fn test_empty_bundle_skips_transport() {
        let (locks, work) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orchestrator = UploadOrchestrator::new(transport.clone(), &config(&locks), work.path());
        let src = TempDir::new().unwrap();
        let mut empty = metadata(&src);
        empty.file.clear();

        let report = orchestrator
            .upload("ds_7", &empty, &ProgressReporter::disabled())
            .await;

        assert_eq!(report.session.state, UploadState::Verified);
        assert_eq!(*transport.submits.lock().unwrap(), 0);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_verification_error_keeps_bundle_and_releases_lock() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![status(
            IngestState::Failed,
            25.0,
            "sha1 mismatch",
        )]));
        let orchestrator = UploadOrchestrator::new(transport, &config(&locks), work.path());

        let report = orchestrator
            .upload("ds_7", &metadata(&src), &ProgressReporter::disabled())
            .await;

        assert_eq!(report.session.state, UploadState::Failed);
        assert!(matches!(report.error, Some(ArchiveError::VerificationFailed(ref m)) if m == "sha1 mismatch"));
        let kept = report.retained_bundle.unwrap();
        assert!(kept.exists());
        assert!(!LockManager::new(locks.path()).is_locked("ds_7"));
    }

    #[tokio::test]
    async fn test_poll_limit_times_out() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![status(
            IngestState::InProgress,
            25.0,
            "received",
        )]));
        let orchestrator = UploadOrchestrator::new(transport.clone(), &config(&locks), work.path());

        let report = orchestrator
            .upload("ds_7", &metadata(&src), &ProgressReporter::disabled())
            .await;

        assert!(matches!(report.error, Some(ArchiveError::VerificationTimeout(3))));
        assert_eq!(*transport.checks.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rejected_submission_fails() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::rejecting("quota exceeded"));
        let orchestrator = UploadOrchestrator::new(transport, &config(&locks), work.path());

        let report = orchestrator
            .upload("ds_7", &metadata(&src), &ProgressReporter::disabled())
            .await;

        assert_eq!(report.session.state, UploadState::Failed);
        assert!(report.session.status_uri.is_none());
        assert!(report.retained_bundle.is_some());
        assert!(!LockManager::new(locks.path()).is_locked("ds_7"));
    }

    /// Accepts the bundle, then never answers a status check
    struct StalledTransport;

    #[async_trait]
    impl ArchiveTransport for StalledTransport {
        async fn submit(&self, _bundle: &BundleArtifact, _p: &ProgressReporter) -> Result<String> {
            Ok("https://ingest.test/status/2".to_string())
        }

        async fn check_status(&self, _status_uri: &str) -> Result<IngestStatus> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_dropped_upload_releases_lock() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let orchestrator = UploadOrchestrator::new(Arc::new(StalledTransport), &config(&locks), work.path());
        let metadata = metadata(&src);

        let progress = ProgressReporter::disabled();
        let upload = orchestrator.upload("ds_7", &metadata, &progress);
        let abandoned = tokio::time::timeout(Duration::from_millis(200), upload).await;

        assert!(abandoned.is_err());
        assert!(!LockManager::new(locks.path()).is_locked("ds_7"));
        // a later run can take the lock again
        assert!(LockManager::new(locks.path()).acquire("ds_7").is_ok());
    }

    #[tokio::test]
    async fn test_bundling_error_releases_lock() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orchestrator = UploadOrchestrator::new(transport.clone(), &config(&locks), work.path());
        let mut metadata = metadata(&src);
        metadata.file[0].local_file_path = src.path().join("gone.raw").to_string_lossy().into_owned();

        let report = orchestrator
            .upload("ds_7", &metadata, &ProgressReporter::disabled())
            .await;

        assert_eq!(report.session.state, UploadState::Failed);
        assert!(matches!(report.error, Some(ArchiveError::Io { .. })));
        assert!(report.retained_bundle.is_none());
        assert_eq!(*transport.submits.lock().unwrap(), 0);
        assert!(!LockManager::new(locks.path()).is_locked("ds_7"));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_fails_before_bundling() {
        let (locks, work, src) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orchestrator = UploadOrchestrator::new(transport.clone(), &config(&locks), work.path());
        let _held = LockManager::new(locks.path()).acquire("ds_7").unwrap();

        let report = orchestrator
            .upload("ds_7", &metadata(&src), &ProgressReporter::disabled())
            .await;

        assert!(matches!(report.error, Some(ArchiveError::Locked(_))));
        assert_eq!(*transport.submits.lock().unwrap(), 0);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }
}
