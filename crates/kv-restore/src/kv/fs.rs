use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, StoredValue};

const ENTRY_SUFFIX: &str = ".json";

/// One JSON document per key. File names are the hex-encoded key so arbitrary keys
/// (slashes, '@', unicode) map to flat, portable names.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("failed to create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}{ENTRY_SUFFIX}", hex::encode(key.as_bytes())))
    }

    fn encode(value: &str, metadata: Option<&serde_json::Value>) -> Result<String> {
        let doc = StoredValue {
            value: value.to_string(),
            metadata: metadata.cloned(),
        };
        serde_json::to_string(&doc)
            .map_err(|e| Error::storage(format!("failed to encode store entry: {e}")))
    }
}

fn decode_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(ENTRY_SUFFIX)?;
    let raw = hex::decode(stem).ok()?;
    String::from_utf8(raw).ok()
}

fn tomb_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::storage(format!("invalid entry path: {}", path.display())))?;
    Ok(path.with_file_name(format!(
        ".{file_name}.tomb.{}.{:016x}",
        std::process::id(),
        rand::random::<u64>()
    )))
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::storage(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::storage(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::storage(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

impl KeyValueStore for FsStore {
    fn name(&self) -> &str {
        "fs"
    }

    fn get_with_metadata(&self, key: &str) -> Result<Option<StoredValue>> {
        let p = self.entry_path(key);
        let raw = match fs::read_to_string(&p) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to read {}: {e}",
                    p.display()
                )));
            }
        };
        serde_json::from_str::<StoredValue>(&raw)
            .map(Some)
            .map_err(|e| Error::storage(format!("corrupt store entry for '{key}': {e}")))
    }

    fn put(&self, key: &str, value: &str, metadata: Option<&serde_json::Value>) -> Result<()> {
        let body = Self::encode(value, metadata)?;
        atomic_write_text(&self.entry_path(key), &body)
    }

    fn put_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let p = self.entry_path(key);
        let body = Self::encode(value, None)?;
        // Fully written before it becomes visible under the entry name.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(|e| {
            Error::storage(format!("failed to create temp file in {}: {e}", self.root.display()))
        })?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| Error::storage(format!("failed to write {}: {e}", tmp.path().display())))?;
        match tmp.persist_noclobber(&p) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::storage(format!(
                "failed to create {}: {}",
                p.display(),
                e.error
            ))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let p = self.entry_path(key);
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!(
                "failed to remove {}: {e}",
                p.display()
            ))),
        }
    }

    /// The entry is renamed aside first, so only one caller can ever inspect and
    /// remove a given entry. A rejected entry is linked back under its name.
    fn remove_if(&self, key: &str, pred: &dyn Fn(Option<&StoredValue>) -> bool) -> Result<bool> {
        let p = self.entry_path(key);
        let tomb = tomb_path(&p)?;
        match fs::rename(&p, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to move aside {}: {e}",
                    p.display()
                )));
            }
        }

        let entry = fs::read_to_string(&tomb)
            .ok()
            .and_then(|raw| serde_json::from_str::<StoredValue>(&raw).ok());
        if pred(entry.as_ref()) {
            if let Err(e) = fs::remove_file(&tomb) {
                warn!(path = %tomb.display(), error = %e, "failed to remove tombstone");
            }
            return Ok(true);
        }

        match fs::hard_link(&tomb, &p) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(key, "entry re-created while set aside; dropping the old one");
            }
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to restore {} from {}: {e}",
                    p.display(),
                    tomb.display()
                )));
            }
        }
        let _ = fs::remove_file(&tomb);
        Ok(false)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let rd = fs::read_dir(&self.root)
            .map_err(|e| Error::storage(format!("failed to list {}: {e}", self.root.display())))?;
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent?;
            let name = ent.file_name();
            // Temp files start with '.' and never decode.
            let Some(key) = name.to_str().and_then(decode_file_name) else {
                continue;
            };
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        out.sort();
        Ok(out)
    }
}
