use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const BACKUP_FORMAT_VERSION: &str = "2.2.5";

/// One exported file: its index metadata and, for payload-carrying uploads, the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub value: Option<String>,
}

impl FileEntry {
    pub fn metadata_only(metadata: serde_json::Value) -> Self {
        Self {
            metadata,
            value: None,
        }
    }
}

/// In-memory form of a backup. Both collections iterate in key order, which keeps
/// chunking deterministic for the lifetime of a task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub timestamp: i64,
    pub version: String,
    pub files: BTreeMap<String, FileEntry>,
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    pub fn total_files(&self) -> usize {
        self.files.len()
    }

    pub fn total_settings(&self) -> usize {
        self.settings.len()
    }

    pub fn to_document(&self) -> BackupDocument {
        BackupDocument {
            timestamp: Some(self.timestamp),
            version: Some(self.version.clone()),
            data: Some(BackupData {
                file_count: Some(self.files.len() as u64),
                files: Some(self.files.clone()),
                settings: Some(self.settings.clone()),
            }),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let doc: BackupDocument = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("invalid backup JSON: {e}")))?;
        Snapshot::try_from(doc)
    }
}

/// Wire format of an exported backup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupDocument {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub data: Option<BackupData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    #[serde(default)]
    pub file_count: Option<u64>,
    #[serde(default)]
    pub files: Option<BTreeMap<String, FileEntry>>,
    #[serde(default)]
    pub settings: Option<BTreeMap<String, serde_json::Value>>,
}

impl TryFrom<BackupDocument> for Snapshot {
    type Error = Error;

    fn try_from(doc: BackupDocument) -> Result<Self> {
        let Some(data) = doc.data else {
            return Err(Error::validation("invalid backup format: missing 'data'"));
        };
        let Some(files) = data.files else {
            return Err(Error::validation(
                "invalid backup format: missing 'data.files'",
            ));
        };
        let Some(settings) = data.settings else {
            return Err(Error::validation(
                "invalid backup format: missing 'data.settings'",
            ));
        };
        Ok(Snapshot {
            timestamp: doc.timestamp.unwrap_or_default(),
            version: doc.version.unwrap_or_default(),
            files,
            settings,
        })
    }
}
