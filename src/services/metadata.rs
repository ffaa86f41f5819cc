//! The bundle descriptor sent to the archive with every upload.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobParams;
use crate::error::Result;
use crate::models::{DiffResult, LocalFileRecord};
use crate::utils::validation::join_item_path;

/// Top folder under which the archive files every dataset
pub const ARCHIVE_DATA_ROOT: &str = "data";

pub const METADATA_VERSION: &str = "1.2.0";

/// Archive-side id for "instrument not registered with EUS"
pub const UNKNOWN_EUS_INSTRUMENT_ID: &str = "34127";

/// Archive-side placeholder proposal for datasets without one
pub const UNKNOWN_EUS_PROPOSAL_ID: &str = "17797";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataBundle {
    pub bundle_name: String,
    /// Unix epoch seconds, UTC
    pub creation_date: i64,
    pub version: String,
    pub eus_info: EusInfo,
    pub file: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EusInfo {
    pub instrument_id: String,
    pub instrument_name: String,
    #[serde(rename = "proposalID")]
    pub proposal_id: String,
    pub groups: Vec<GroupTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTag {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Destination path inside the archive
    pub path: String,
    pub sha1_hash: String,
    pub size_in_bytes: u64,
    pub local_file_path: String,
    /// Unix epoch seconds, UTC
    pub creation_date: i64,
    pub destination_directory: String,
    pub file_name: String,
}

/// Identity fields the archive files a dataset under
#[derive(Debug, Clone)]
pub struct DatasetIdentity {
    pub name: String,
    pub id: u64,
    pub instrument_name: String,
    pub created: DateTime<Utc>,
    pub eus_instrument_id: Option<String>,
    pub eus_proposal_id: Option<String>,
}

impl From<&JobParams> for DatasetIdentity {
    fn from(params: &JobParams) -> Self {
        Self {
            name: params.dataset_name.clone(),
            id: params.dataset_id,
            instrument_name: params.instrument_name.clone(),
            created: params.created,
            eus_instrument_id: params.eus_instrument_id.clone(),
            eus_proposal_id: params.eus_proposal_id.clone(),
        }
    }
}

/// `"{year}_{quarter}"`, quarter being ceil(month / 3)
pub fn year_quarter(date: &DateTime<Utc>) -> String {
    let quarter = date.month().div_ceil(3);
    format!("{}_{}", date.year(), quarter)
}

impl MetadataBundle {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn total_bytes(&self) -> u64 {
        self.file.iter().map(|f| f.size_in_bytes).sum()
    }
}

pub struct MetadataBuilder;

impl MetadataBuilder {
    pub fn build(
        diff: &DiffResult,
        identity: &DatasetIdentity,
        sub_folder: Option<&str>,
    ) -> MetadataBundle {
        Self::build_at(diff, identity, sub_folder, Utc::now())
    }

    /// Same as [`MetadataBuilder::build`] with an explicit creation time
    pub fn build_at(
        diff: &DiffResult,
        identity: &DatasetIdentity,
        sub_folder: Option<&str>,
        now: DateTime<Utc>,
    ) -> MetadataBundle {
        let bundle_name = match sub_folder.filter(|s| !s.is_empty()) {
            Some(sub) => format!(
                "{}_{}_{}",
                identity.name,
                identity.id,
                sub.trim_matches(['/', '\\']).replace(['/', '\\'], "_")
            ),
            None => format!("{}_{}", identity.name, identity.id),
        };

        let groups = vec![
            GroupTag {
                name: identity.instrument_name.clone(),
                kind: "omics.dms.instrument".to_string(),
            },
            GroupTag {
                name: year_quarter(&identity.created),
                kind: "omics.dms.date_code".to_string(),
            },
            GroupTag {
                name: identity.name.clone(),
                kind: "omics.dms.dataset".to_string(),
            },
            GroupTag {
                name: identity.id.to_string(),
                kind: "omics.dms.dataset_id".to_string(),
            },
        ];

        let eus_info = EusInfo {
            instrument_id: identity
                .eus_instrument_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_EUS_INSTRUMENT_ID.to_string()),
            instrument_name: identity.instrument_name.clone(),
            proposal_id: identity
                .eus_proposal_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_EUS_PROPOSAL_ID.to_string()),
            groups,
        };

        MetadataBundle {
            bundle_name,
            creation_date: now.timestamp(),
            version: METADATA_VERSION.to_string(),
            eus_info,
            file: diff.upload_set().map(file_entry).collect(),
        }
    }
}

fn file_entry(record: &LocalFileRecord) -> FileEntry {
    let destination_directory =
        join_item_path([ARCHIVE_DATA_ROOT, record.relative_directory.as_str()]);
    FileEntry {
        path: join_item_path([destination_directory.as_str(), record.file_name.as_str()]),
        sha1_hash: record.content_digest.clone(),
        size_in_bytes: record.size_bytes,
        local_file_path: record.absolute_path.to_string_lossy().into_owned(),
        creation_date: record.creation_timestamp.timestamp(),
        destination_directory,
        file_name: record.file_name.clone(),
    }
}
