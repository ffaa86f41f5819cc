//! HTTP calls to the ingest service: bundle submission and status checks.

use async_trait::async_trait;
use futures::StreamExt;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::io::ReaderStream;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::services::bundler::BundleArtifact;
use crate::services::progress::ProgressReporter;
use crate::utils::retry::RetryPolicy;

/// Index of the archive's "verified" step; earlier steps are submitted,
/// received and processing.
pub const VERIFIED_STEP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    InProgress,
    Verified,
    Failed,
}

/// One reading of the status page
#[derive(Debug, Clone, PartialEq)]
pub struct IngestStatus {
    pub state: IngestState,
    /// Progress toward verification, 0 to 100
    pub percent: f32,
    pub message: String,
    pub transaction_id: Option<String>,
}

#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    /// Sends the bundle and returns the URI to poll for its status
    async fn submit(&self, bundle: &BundleArtifact, progress: &ProgressReporter)
    -> Result<String>;

    async fn check_status(&self, status_uri: &str) -> Result<IngestStatus>;
}

pub struct HttpArchiveTransport {
    client: reqwest::Client,
    config: ArchiveConfig,
    retry: RetryPolicy,
}

impl HttpArchiveTransport {
    pub fn new(client: reqwest::Client, config: ArchiveConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            retry,
        }
    }

    fn with_credentials(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn submit_once(
        &self,
        bundle: &BundleArtifact,
        progress: &ProgressReporter,
    ) -> Result<String> {
        let url = self.config.upload_url();
        let file = tokio::fs::File::open(&bundle.path)
            .await
            .map_err(|e| ArchiveError::io(&bundle.path, e))?;

        let total = bundle.size_bytes;
        let sent = Arc::new(AtomicU64::new(0));
        let reporter = progress.clone();
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                let so_far = sent.fetch_add(bytes.len() as u64, Ordering::SeqCst)
                    + bytes.len() as u64;
                reporter.uploading(so_far, total);
            }
        });

        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));

        let response = self.with_credentials(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                url,
                status: status.as_u16(),
                body,
            });
        }

        parse_status_uri(&body, &self.config.ingest_base_url())
    }

    async fn status_once(&self, url: &str) -> Result<IngestStatus> {
        let request = self.client.get(url);
        let response = self.with_credentials(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(ArchiveError::EmptyResponse(url.to_string()));
        }
        parse_status_xml(&body)
    }
}

#[async_trait]
impl ArchiveTransport for HttpArchiveTransport {
    async fn submit(
        &self,
        bundle: &BundleArtifact,
        progress: &ProgressReporter,
    ) -> Result<String> {
        tracing::info!(
            "📤 Submitting {} ({} bytes) to {}",
            bundle.path.display(),
            bundle.size_bytes,
            self.config.upload_url()
        );
        self.retry
            .run("bundle submission", || self.submit_once(bundle, progress))
            .await
    }

    async fn check_status(&self, status_uri: &str) -> Result<IngestStatus> {
        let url = format!("{}/xml", status_uri.trim_end_matches('/'));
        self.retry
            .run("status check", || self.status_once(&url))
            .await
    }
}

/// Finds the status URI in a submission response body.
///
/// The body is either the URI itself, possibly surrounded by other lines, or
/// a path relative to the ingest host.
pub fn parse_status_uri(body: &str, ingest_base: &str) -> Result<String> {
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Ok(url) = url::Url::parse(line) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(url.to_string().trim_end_matches('/').to_string());
            }
        }
        if line.starts_with('/') && !line.contains(char::is_whitespace) {
            let base = url::Url::parse(ingest_base)?;
            return Ok(base.join(line)?.to_string().trim_end_matches('/').to_string());
        }
    }
    Err(ArchiveError::SubmissionRejected(format!(
        "no status URI in response: {}",
        body.trim()
    )))
}

/// Parses the status page.
///
/// ```xml
/// <myemsl><status>
///   <transaction id="1234"/>
///   <step id="0" message="completed" status="SUCCESS"/>
///   <step id="3" message="verified" status="SUCCESS"/>
/// </status></myemsl>
/// ```
pub fn parse_status_xml(body: &str) -> Result<IngestStatus> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut transaction_id = None;
    let mut highest_success: Option<u32> = None;
    let mut error: Option<String> = None;
    let mut last_message = String::new();
    let mut saw_step = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                let mut id = None;
                let mut status = String::new();
                let mut message = String::new();
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    match attr.key.as_ref() {
                        b"id" => id = Some(value),
                        b"status" => status = value,
                        b"message" => message = value,
                        _ => {}
                    }
                }

                match name.as_str() {
                    "transaction" => transaction_id = id,
                    "step" => {
                        saw_step = true;
                        let step: u32 = id.and_then(|v| v.parse().ok()).unwrap_or(0);
                        if !message.is_empty() {
                            last_message = message.clone();
                        }
                        if status.eq_ignore_ascii_case("ERROR") {
                            error.get_or_insert(if message.is_empty() {
                                format!("step {} reported an error", step)
                            } else {
                                message
                            });
                        } else if status.eq_ignore_ascii_case("SUCCESS") {
                            highest_success = Some(highest_success.map_or(step, |h| h.max(step)));
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_step {
        return Err(ArchiveError::Xml(format!(
            "status page has no step elements: {}",
            body.trim()
        )));
    }

    let percent = highest_success
        .map(|s| (s.min(VERIFIED_STEP) + 1) as f32 * 100.0 / (VERIFIED_STEP + 1) as f32)
        .unwrap_or(0.0);

    let state = if let Some(msg) = &error {
        last_message = msg.clone();
        IngestState::Failed
    } else if highest_success.is_some_and(|s| s >= VERIFIED_STEP) {
        IngestState::Verified
    } else {
        IngestState::InProgress
    };

    Ok(IngestStatus {
        state,
        percent,
        message: last_message,
        transaction_id,
    })
}
