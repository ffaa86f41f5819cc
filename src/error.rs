use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Dataset has {count} files, more than the limit of {limit}")]
    CountExceeded { count: usize, limit: usize },

    #[error("Dataset is locked by {}", .0.display())]
    Locked(PathBuf),

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Verification did not complete after {0} status checks")]
    VerificationTimeout(u32),
}

/// Coarse grouping of errors, reported with a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Configuration,
    Transient,
    Remote,
    Verification,
    Local,
}

/// Substrings the archive emits when its backend is briefly overloaded.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout expired",
    "timed out",
    "deadlock",
    "gateway time-out",
    "gateway timeout",
    "service unavailable",
    "connection reset",
];

impl ArchiveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn classification(&self) -> FailureClass {
        match self {
            ArchiveError::MissingParameter(_)
            | ArchiveError::InvalidParameter { .. }
            | ArchiveError::DirectoryNotFound(_)
            | ArchiveError::CountExceeded { .. }
            | ArchiveError::Locked(_)
            | ArchiveError::Url(_) => FailureClass::Configuration,
            ArchiveError::Io { .. } | ArchiveError::Json(_) => FailureClass::Local,
            ArchiveError::VerificationFailed(_) | ArchiveError::VerificationTimeout(_) => {
                FailureClass::Verification
            }
            _ if self.is_transient() => FailureClass::Transient,
            _ => FailureClass::Remote,
        }
    }

    /// True when retrying the same request has a reasonable chance to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            ArchiveError::HttpStatus { status, body, .. } => {
                matches!(status, 502..=504) || has_transient_signature(body)
            }
            ArchiveError::EmptyResponse(_) => true,
            ArchiveError::SubmissionRejected(msg) => has_transient_signature(msg),
            _ => false,
        }
    }
}

fn has_transient_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl From<quick_xml::Error> for ArchiveError {
    fn from(e: quick_xml::Error) -> Self {
        ArchiveError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ArchiveError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        ArchiveError::Xml(e.to_string())
    }
}
