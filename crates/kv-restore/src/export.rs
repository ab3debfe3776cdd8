use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::snapshot::{BACKUP_FORMAT_VERSION, FileEntry, Snapshot};

/// Which keys end up where in an exported snapshot.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub settings_prefix: String,
    pub settings_index_prefix: String,
    /// Engine bookkeeping; never exported.
    pub restore_prefix: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            settings_prefix: "manage@".into(),
            settings_index_prefix: "manage@index".into(),
            restore_prefix: "restore@".into(),
        }
    }
}

fn carries_payload(metadata: &serde_json::Value) -> bool {
    metadata.get("Channel").and_then(|v| v.as_str()) == Some("TelegramNew")
        && metadata.get("IsChunked").and_then(|v| v.as_bool()) == Some(true)
}

/// Build a backup snapshot from the live store.
///
/// Settings are exported as their stored text, so a restore writes back the same
/// bytes. A payload read that fails degrades that file to metadata-only instead of
/// aborting the export.
pub fn export_snapshot(store: &dyn KeyValueStore, opts: &ExportOptions) -> Result<Snapshot> {
    let mut files = BTreeMap::new();
    let mut settings = BTreeMap::new();
    let mut degraded = 0usize;

    for key in store.list("")? {
        if !opts.restore_prefix.is_empty() && key.starts_with(&opts.restore_prefix) {
            continue;
        }
        if key.starts_with(&opts.settings_prefix) {
            if key.starts_with(&opts.settings_index_prefix) {
                continue;
            }
            if let Some(raw) = store.get(&key)? {
                settings.insert(key, serde_json::Value::String(raw));
            }
            continue;
        }

        let metadata = store.metadata(&key)?.unwrap_or(serde_json::Value::Null);
        let mut entry = FileEntry::metadata_only(metadata);
        if carries_payload(&entry.metadata) {
            match store.get(&key) {
                Ok(value) => entry.value = value,
                Err(e) => {
                    warn!(key, error = %e, "file payload unreadable; exporting metadata only");
                    degraded += 1;
                }
            }
        }
        files.insert(key, entry);
    }

    info!(
        files = files.len(),
        settings = settings.len(),
        degraded,
        store = store.name(),
        "snapshot exported"
    );
    Ok(Snapshot {
        timestamp: Utc::now().timestamp_millis(),
        version: BACKUP_FORMAT_VERSION.to_string(),
        files,
        settings,
    })
}
