use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub mod params;

pub use params::{JobParams, Perspective};

/// Archive endpoints and upload limits
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// URL scheme for all archive requests (default: "https")
    pub scheme: String,

    /// Host serving the catalog of already archived files
    pub archive_host: String,

    /// Host accepting bundle uploads and serving status pages
    pub ingest_host: String,

    /// Path of the upload endpoint on the ingest host
    pub upload_path: String,

    /// Path prefix of the catalog query on the archive host
    pub catalog_path: String,

    /// Basic-auth user for the ingest host
    pub username: Option<String>,

    /// Basic-auth password for the ingest host
    pub password: Option<String>,

    /// Maximum number of files in one dataset (default: 500,000)
    pub max_file_count: usize,

    /// Attempts per network call, including the first (default: 3)
    pub retry_attempts: usize,

    /// Fixed pause between attempts (default: 2 seconds)
    pub retry_delay: Duration,

    /// Per-request timeout (default: 5 minutes)
    pub request_timeout: Duration,

    /// Pause between status checks (default: 15 seconds)
    pub status_poll_interval: Duration,

    /// Status checks before giving up on verification (default: 240)
    pub status_poll_limit: u32,

    /// Directory holding per-dataset lock markers
    pub lock_dir: PathBuf,

    /// Target the test archive instead of production
    pub use_test_instance: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            archive_host: "metadata.my.emsl.pnl.gov".to_string(),
            ingest_host: "ingest.my.emsl.pnl.gov".to_string(),
            upload_path: "upload".to_string(),
            catalog_path: "fileinfo/files_for_keyvalue/omics.dms.dataset_id".to_string(),
            username: None,
            password: None,
            max_file_count: 500_000,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(300),
            status_poll_interval: Duration::from_secs(15),
            status_poll_limit: 240,
            lock_dir: env::temp_dir().join("archive-uploader-locks"),
            use_test_instance: false,
        }
    }
}

impl ArchiveConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = if env::var("ARCHIVE_USE_TEST_INSTANCE")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false)
        {
            Self::development()
        } else {
            Self::default()
        };

        Self {
            scheme: env::var("ARCHIVE_SCHEME").unwrap_or(default.scheme),

            archive_host: env::var("ARCHIVE_HOST").unwrap_or(default.archive_host),

            ingest_host: env::var("ARCHIVE_INGEST_HOST").unwrap_or(default.ingest_host),

            upload_path: env::var("ARCHIVE_UPLOAD_PATH").unwrap_or(default.upload_path),

            catalog_path: env::var("ARCHIVE_CATALOG_PATH").unwrap_or(default.catalog_path),

            username: env::var("ARCHIVE_USERNAME").ok().or(default.username),

            password: env::var("ARCHIVE_PASSWORD").ok().or(default.password),

            max_file_count: env::var("ARCHIVE_MAX_FILE_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_count),

            retry_attempts: env::var("ARCHIVE_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.retry_attempts),

            retry_delay: env::var("ARCHIVE_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.retry_delay),

            request_timeout: env::var("ARCHIVE_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.request_timeout),

            status_poll_interval: env::var("ARCHIVE_STATUS_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.status_poll_interval),

            status_poll_limit: env::var("ARCHIVE_STATUS_POLL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.status_poll_limit),

            lock_dir: env::var("ARCHIVE_LOCK_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.lock_dir),

            use_test_instance: default.use_test_instance,
        }
    }

    /// Test archive instance with short waits
    pub fn development() -> Self {
        Self {
            archive_host: "metadata.my.emsl.pnl.gov".to_string(),
            ingest_host: "ingestdmsdev.my.emsl.pnl.gov".to_string(),
            retry_delay: Duration::from_millis(500),
            status_poll_interval: Duration::from_secs(5),
            status_poll_limit: 120,
            use_test_instance: true,
            ..Self::default()
        }
    }

    /// Production archive
    pub fn production() -> Self {
        Self {
            username: env::var("ARCHIVE_USERNAME").ok(),
            password: env::var("ARCHIVE_PASSWORD").ok(),
            ..Self::default()
        }
    }

    /// Config pointed at a single local server, used by integration tests.
    pub fn for_local_server(base: &str) -> Self {
        let (scheme, host) = base.split_once("://").unwrap_or(("http", base));
        Self {
            scheme: scheme.to_string(),
            archive_host: host.trim_end_matches('/').to_string(),
            ingest_host: host.trim_end_matches('/').to_string(),
            retry_delay: Duration::from_millis(5),
            request_timeout: Duration::from_secs(10),
            status_poll_interval: Duration::from_millis(5),
            status_poll_limit: 50,
            ..Self::default()
        }
    }

    pub fn archive_base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.archive_host)
    }

    pub fn ingest_base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.ingest_host)
    }

    pub fn upload_url(&self) -> String {
        format!(
            "{}/{}",
            self.ingest_base_url(),
            self.upload_path.trim_start_matches('/')
        )
    }
}
