//! Reads the archive's catalog of files it already holds for a dataset.
//!
//! One catalog request returns every (path, SHA-1) pair for the dataset.
//! The older protocol that walked the archive's directory tree and fetched
//! one digest per item is intentionally not supported.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::models::RemoteFileRecord;
use crate::services::metadata::ARCHIVE_DATA_ROOT;
use crate::utils::hash::is_sha1_hex;
use crate::utils::retry::RetryPolicy;
use crate::utils::validation::join_item_path;

/// Where a dataset lives in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetAddress {
    pub dataset_id: u64,
    /// Limits the index to one folder of the dataset
    pub sub_folder: Option<String>,
}

/// Files the archive holds for one dataset, keyed by dataset-relative path
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    records: HashMap<String, String>,
    folded: HashMap<String, String>,
}

impl RemoteIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = RemoteFileRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index
                .folded
                .insert(record.relative_path.to_lowercase(), record.content_digest.clone());
            index
                .records
                .insert(record.relative_path, record.content_digest);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn digest_for(&self, path: &str, ignore_case: bool) -> Option<&str> {
        if ignore_case {
            self.folded.get(&path.to_lowercase()).map(String::as_str)
        } else {
            self.records.get(path).map(String::as_str)
        }
    }

    /// Keeps only entries inside `sub_folder`
    fn restrict_to(self, sub_folder: Option<&str>, ignore_case: bool) -> Self {
        let Some(prefix) = sub_folder.map(|s| join_item_path([s])).filter(|s| !s.is_empty())
        else {
            return self;
        };
        let prefix = format!("{}/", prefix);
        let folded_prefix = prefix.to_lowercase();
        let inside = |path: &str| {
            if ignore_case {
                path.to_lowercase().starts_with(&folded_prefix)
            } else {
                path.starts_with(&prefix)
            }
        };
        Self::from_records(
            self.records
                .into_iter()
                .filter(|(path, _)| inside(path.as_str()))
                .map(|(relative_path, content_digest)| RemoteFileRecord {
                    relative_path,
                    content_digest,
                }),
        )
    }
}

#[async_trait]
pub trait RemoteIndexSource: Send + Sync {
    /// Fetch the archived files for a dataset. Errors are returned as-is.
    async fn fetch(&self, address: &DatasetAddress) -> Result<Vec<RemoteFileRecord>>;
}

/// Reads the index, treating an unreachable archive as holding nothing.
///
/// Uploading everything again is wasteful but safe; skipping files the
/// archive lacks is not.
pub async fn read_index_or_empty(
    source: &dyn RemoteIndexSource,
    address: &DatasetAddress,
    ignore_case: bool,
) -> RemoteIndex {
    match source.fetch(address).await {
        Ok(records) => {
            // The catalog lists the whole dataset; sub-folders are narrowed here.
            let index = RemoteIndex::from_records(records)
                .restrict_to(address.sub_folder.as_deref(), ignore_case);
            tracing::info!(
                "📚 Archive holds {} files for dataset {}",
                index.len(),
                address.dataset_id
            );
            index
        }
        Err(e) => {
            tracing::warn!(
                "⚠️  Could not read archive index for dataset {}: {}. Treating every file as new.",
                address.dataset_id,
                e
            );
            RemoteIndex::empty()
        }
    }
}

/// Catalog query over HTTP
pub struct CatalogIndexReader {
    client: reqwest::Client,
    config: ArchiveConfig,
    retry: RetryPolicy,
}

impl CatalogIndexReader {
    pub fn new(client: reqwest::Client, config: ArchiveConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            retry,
        }
    }

    pub fn catalog_url(&self, address: &DatasetAddress) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.config.archive_base_url())?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ArchiveError::InvalidParameter {
                    name: "archive_host".to_string(),
                    reason: "cannot carry a path".to_string(),
                }
            })?;
            segments.pop_if_empty();
            segments.extend(self.config.catalog_path.split('/').filter(|s| !s.is_empty()));
            segments.push(&address.dataset_id.to_string());
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &url::Url) -> Result<Option<String>> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
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
        Ok(Some(body))
    }
}

#[async_trait]
impl RemoteIndexSource for CatalogIndexReader {
    async fn fetch(&self, address: &DatasetAddress) -> Result<Vec<RemoteFileRecord>> {
        let url = self.catalog_url(address)?;
        tracing::debug!("Querying archive catalog {}", url);

        let body = self
            .retry
            .run_if("catalog query", is_retryable_catalog_error, || {
                self.fetch_once(&url)
            })
            .await?;

        match body {
            Some(body) => parse_catalog(&body),
            None => Ok(Vec::new()),
        }
    }
}

/// Any server error is worth another catalog attempt; the catalog is read-only.
fn is_retryable_catalog_error(error: &ArchiveError) -> bool {
    match error {
        ArchiveError::HttpStatus { status, .. } if *status >= 500 => true,
        other => other.is_transient(),
    }
}

/// Index source that never finds anything, for dry runs and first uploads
pub struct NoRemoteIndex;

#[async_trait]
impl RemoteIndexSource for NoRemoteIndex {
    async fn fetch(&self, _address: &DatasetAddress) -> Result<Vec<RemoteFileRecord>> {
        Ok(Vec::new())
    }
}

/// Parses a catalog body, JSON or XML
pub fn parse_catalog(body: &str) -> Result<Vec<RemoteFileRecord>> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        parse_catalog_xml(trimmed)
    } else {
        let value: Value = serde_json::from_str(trimmed)?;
        let mut records = Vec::new();
        collect_json_records(&value, &mut records);
        Ok(records)
    }
}

/// Builds a record from whichever path and digest fields are present
fn record_from_fields(fields: &HashMap<String, String>) -> Option<RemoteFileRecord> {
    if let Some(kind) = fields.get("hashtype") {
        if !kind.eq_ignore_ascii_case("sha1") {
            return None;
        }
    }

    let digest = ["sha1", "sha1hash", "sha1_hash", "hashsum", "checksum"]
        .iter()
        .find_map(|k| fields.get(*k))?;

    let raw_path = match ["relativepath", "relative_path", "path"]
        .iter()
        .find_map(|k| fields.get(*k))
    {
        Some(path) => path.clone(),
        None => {
            let name = fields.get("name")?;
            let dir = fields.get("subdir").map(String::as_str).unwrap_or("");
            join_item_path([dir, name.as_str()])
        }
    };

    let relative_path = normalize_remote_path(&raw_path);
    let content_digest = digest.trim().to_lowercase();
    if relative_path.is_empty() || !is_sha1_hex(&content_digest) {
        return None;
    }

    Some(RemoteFileRecord {
        relative_path,
        content_digest,
    })
}

/// Strips the archive's `data/` root and any leading separators
fn normalize_remote_path(path: &str) -> String {
    let joined = join_item_path([path]);
    match joined.split_once('/') {
        Some((root, rest)) if root == ARCHIVE_DATA_ROOT => rest.to_string(),
        _ => joined,
    }
}

fn collect_json_records(value: &Value, out: &mut Vec<RemoteFileRecord>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_json_records(item, out);
            }
        }
        Value::Object(map) => {
            let fields: HashMap<String, String> = map
                .iter()
                .filter_map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        _ => return None,
                    };
                    Some((k.to_lowercase(), text))
                })
                .collect();

            if let Some(record) = record_from_fields(&fields) {
                out.push(record);
                return;
            }
            for nested in map.values() {
                collect_json_records(nested, out);
            }
        }
        _ => {}
    }
}

fn attribute_fields(e: &BytesStart) -> Result<HashMap<String, String>> {
    let mut fields = HashMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        fields.insert(
            String::from_utf8_lossy(attr.key.as_ref()).to_lowercase(),
            String::from_utf8_lossy(&attr.value).to_string(),
        );
    }
    Ok(fields)
}

fn parse_catalog_xml(body: &str) -> Result<Vec<RemoteFileRecord>> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current_tag = String::new();
    // Child elements of the enclosing <file>/<item>
    let mut pending: HashMap<String, String> = HashMap::new();
    // The enclosing element already produced a record from its attributes
    let mut pending_recorded = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let fields = attribute_fields(&e)?;
                let recorded = match record_from_fields(&fields) {
                    Some(record) => {
                        records.push(record);
                        true
                    }
                    None => false,
                };
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                if current_tag == "file" || current_tag == "item" {
                    pending = fields;
                    pending_recorded = recorded;
                }
            }
            Event::Empty(e) => {
                if let Some(record) = record_from_fields(&attribute_fields(&e)?) {
                    records.push(record);
                }
            }
            Event::Text(e) => {
                let txt = String::from_utf8_lossy(e.as_ref()).to_string();
                if !txt.is_empty() && !current_tag.is_empty() {
                    pending.insert(current_tag.clone(), txt);
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                if name == "file" || name == "item" {
                    if !pending_recorded {
                        if let Some(record) = record_from_fields(&pending) {
                            records.push(record);
                        }
                    }
                    pending.clear();
                    pending_recorded = false;
                }
                current_tag.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(records)
}
