//! Typed view over the flat parameter maps supplied by the job host.

use crate::error::{ArchiveError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which storage volume path to use when locating the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Perspective {
    /// Running on the storage server itself
    #[default]
    Server,
    /// Running on a processing box that sees the share remotely
    Client,
}

impl std::str::FromStr for Perspective {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "server" | "" => Ok(Perspective::Server),
            "client" => Ok(Perspective::Client),
            other => Err(ArchiveError::InvalidParameter {
                name: "perspective".to_string(),
                reason: format!("expected 'client' or 'server', got '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobParams {
    pub job: u64,
    pub dataset_name: String,
    pub dataset_id: u64,
    pub dataset_folder: String,
    pub storage_vol: String,
    pub storage_vol_external: String,
    pub storage_path: String,
    pub instrument_name: String,
    pub eus_instrument_id: Option<String>,
    pub eus_proposal_id: Option<String>,
    pub created: DateTime<Utc>,
    pub recurse: bool,
    /// Restricts the run to one sub-folder of the dataset
    pub output_folder: Option<String>,
    pub step_tool: String,
    pub perspective: Perspective,
    pub work_dir: PathBuf,
}

impl JobParams {
    /// Parse the task and manager parameter maps.
    ///
    /// `Folder`, `Job`, `Dataset` and `Dataset_ID` are required; every other
    /// key falls back to a default.
    pub fn from_maps(
        task: &HashMap<String, String>,
        manager: &HashMap<String, String>,
    ) -> Result<Self> {
        let dataset_folder = required(task, "Folder")?;
        let job = parse_number("Job", &required(task, "Job")?)?;
        let dataset_name = required(task, "Dataset")?;
        let dataset_id = parse_number("Dataset_ID", &required(task, "Dataset_ID")?)?;

        let created = match optional(task, "Created") {
            Some(value) => parse_created(&value)?,
            None => Utc::now(),
        };

        let recurse = optional(task, "MyEMSL_Recurse")
            .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        let perspective = optional(manager, "perspective")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let work_dir = optional(manager, "workdir")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            job,
            dataset_name,
            dataset_id,
            dataset_folder,
            storage_vol: optional(task, "Storage_Vol").unwrap_or_default(),
            storage_vol_external: optional(task, "Storage_Vol_External").unwrap_or_default(),
            storage_path: optional(task, "Storage_Path").unwrap_or_default(),
            instrument_name: optional(task, "Instrument_Name").unwrap_or_default(),
            eus_instrument_id: optional(task, "EUS_Instrument_ID"),
            eus_proposal_id: optional(task, "EUS_Proposal_ID"),
            created,
            recurse,
            output_folder: optional(task, "OutputFolderName"),
            step_tool: optional(task, "StepTool").unwrap_or_else(|| "DatasetArchive".to_string()),
            perspective,
            work_dir,
        })
    }

    /// Directory holding the whole dataset as seen from this host
    pub fn dataset_directory(&self) -> PathBuf {
        let volume = match self.perspective {
            Perspective::Client if !self.storage_vol_external.is_empty() => {
                &self.storage_vol_external
            }
            _ => &self.storage_vol,
        };
        PathBuf::from(volume)
            .join(&self.storage_path)
            .join(&self.dataset_folder)
    }

    /// Key used for lock markers and log lines
    pub fn dataset_key(&self) -> String {
        format!("{}_{}", self.dataset_name, self.dataset_id)
    }
}

fn optional(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(map: &HashMap<String, String>, key: &str) -> Result<String> {
    optional(map, key).ok_or_else(|| ArchiveError::MissingParameter(key.to_string()))
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| ArchiveError::InvalidParameter {
        name: key.to_string(),
        reason: format!("'{}' is not a positive integer", value),
    })
}

/// Accepts RFC 3339 and the date layouts the job host emits.
pub fn parse_created(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    const LAYOUTS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
    ];
    for layout in LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return Ok(naive.and_utc());
        }
    }

    for layout in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Some(naive) = NaiveDate::parse_from_str(value, layout)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(naive.and_utc());
        }
    }

    Err(ArchiveError::InvalidParameter {
        name: "Created".to_string(),
        reason: format!("unrecognized date '{}'", value),
    })
}
