use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::snapshot::Snapshot;
use crate::task::{ChunkLayout, Keys, Phase};

/// One `(key, value)` pair of a snapshot collection. File values are encoded
/// `FileEntry` documents, setting values are stored as-is.
pub type ChunkEntry = (String, serde_json::Value);

#[derive(Debug, Serialize, Deserialize)]
struct ChunkDoc {
    sha256: String,
    entries: Vec<ChunkEntry>,
}

fn entries_digest(entries: &[ChunkEntry]) -> Result<String> {
    let encoded = serde_json::to_vec(entries)
        .map_err(|e| Error::storage(format!("chunk encode failed: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

/// Both collections of `snapshot`, in key order, sliced into groups of `chunk_size`.
pub fn partition(
    snapshot: &Snapshot,
    chunk_size: usize,
) -> Result<(Vec<Vec<ChunkEntry>>, Vec<Vec<ChunkEntry>>)> {
    let size = chunk_size.max(1);
    let mut files = Vec::with_capacity(snapshot.files.len());
    for (k, f) in &snapshot.files {
        let v = serde_json::to_value(f)
            .map_err(|e| Error::storage(format!("failed to encode file entry '{k}': {e}")))?;
        files.push((k.clone(), v));
    }
    let settings = snapshot
        .settings
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Vec<_>>();

    let slice = |all: Vec<ChunkEntry>| -> Vec<Vec<ChunkEntry>> {
        all.chunks(size).map(<[ChunkEntry]>::to_vec).collect()
    };
    Ok((slice(files), slice(settings)))
}

/// Persists snapshot collections as fixed-size pages addressed by
/// `(task, collection, index)` so a task never needs the whole snapshot in memory.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn KeyValueStore>,
    keys: Keys,
    chunk_size: usize,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Keys, chunk_size: usize) -> Self {
        Self {
            store,
            keys,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Writes every chunk. On failure the chunks written so far are removed and the
    /// error is returned; the caller must not create a task.
    pub fn store(&self, task_id: &str, snapshot: &Snapshot) -> Result<ChunkLayout> {
        let (files, settings) = partition(snapshot, self.chunk_size)?;
        let layout = ChunkLayout {
            total_files: snapshot.total_files(),
            total_settings: snapshot.total_settings(),
            file_chunks: files.len(),
            setting_chunks: settings.len(),
        };

        let write_all = || -> Result<()> {
            for (phase, chunks) in [(Phase::Files, &files), (Phase::Settings, &settings)] {
                for (index, entries) in chunks.iter().enumerate() {
                    self.write_chunk(task_id, phase, index, entries)?;
                }
            }
            Ok(())
        };

        if let Err(e) = write_all() {
            if let Err(cleanup) = self.delete_all(task_id) {
                warn!(task_id, error = %cleanup, "failed to clean up partial chunks");
            }
            return Err(Error::storage(format!(
                "failed to persist chunks for task '{task_id}': {e}"
            )));
        }

        debug!(
            task_id,
            file_chunks = layout.file_chunks,
            setting_chunks = layout.setting_chunks,
            "snapshot chunks stored"
        );
        Ok(layout)
    }

    fn write_chunk(
        &self,
        task_id: &str,
        phase: Phase,
        index: usize,
        entries: &[ChunkEntry],
    ) -> Result<()> {
        let doc = ChunkDoc {
            sha256: entries_digest(entries)?,
            entries: entries.to_vec(),
        };
        let body = serde_json::to_string(&doc)
            .map_err(|e| Error::storage(format!("chunk encode failed: {e}")))?;
        self.store
            .put(&self.keys.chunk(task_id, phase, index), &body, None)
    }

    /// A missing chunk reads as empty: there are no more entries at that position.
    /// Undecodable or tampered chunks are validation errors; store read failures keep
    /// the store's error kind.
    pub fn load_chunk(&self, task_id: &str, phase: Phase, index: usize) -> Result<Vec<ChunkEntry>> {
        let key = self.keys.chunk(task_id, phase, index);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(Vec::new());
        };
        let doc: ChunkDoc = serde_json::from_str(&raw)
            .map_err(|e| Error::validation(format!("corrupt chunk '{key}': {e}")))?;
        let digest = entries_digest(&doc.entries)?;
        if digest != doc.sha256 {
            return Err(Error::validation(format!(
                "chunk '{key}' failed integrity check (expected {}, got {digest})",
                doc.sha256
            )));
        }
        Ok(doc.entries)
    }

    pub fn delete_all(&self, task_id: &str) -> Result<()> {
        let keys = self.store.list(&self.keys.chunks_prefix(task_id))?;
        for key in &keys {
            self.store.delete(key)?;
        }
        debug!(task_id, removed = keys.len(), "task chunks deleted");
        Ok(())
    }
}

/// Where a step reads its entries from.
pub trait ChunkSource {
    fn chunk(&self, phase: Phase, index: usize) -> Result<Vec<ChunkEntry>>;

    /// Drop backing data once the task is terminal.
    fn release(&self) -> Result<()>;
}

pub struct PersistedChunks<'a> {
    chunks: &'a ChunkStore,
    task_id: &'a str,
}

impl<'a> PersistedChunks<'a> {
    pub fn new(chunks: &'a ChunkStore, task_id: &'a str) -> Self {
        Self { chunks, task_id }
    }
}

impl ChunkSource for PersistedChunks<'_> {
    fn chunk(&self, phase: Phase, index: usize) -> Result<Vec<ChunkEntry>> {
        self.chunks.load_chunk(self.task_id, phase, index)
    }

    fn release(&self) -> Result<()> {
        self.chunks.delete_all(self.task_id)
    }
}

/// Snapshot pages held in memory for a single run-to-completion execution.
pub struct InMemoryChunks {
    files: Vec<Vec<ChunkEntry>>,
    settings: Vec<Vec<ChunkEntry>>,
}

impl InMemoryChunks {
    pub fn new(snapshot: &Snapshot, chunk_size: usize) -> Result<(Self, ChunkLayout)> {
        let (files, settings) = partition(snapshot, chunk_size)?;
        let layout = ChunkLayout {
            total_files: snapshot.total_files(),
            total_settings: snapshot.total_settings(),
            file_chunks: files.len(),
            setting_chunks: settings.len(),
        };
        Ok((Self { files, settings }, layout))
    }
}

impl ChunkSource for InMemoryChunks {
    fn chunk(&self, phase: Phase, index: usize) -> Result<Vec<ChunkEntry>> {
        let pages = match phase {
            Phase::Files => &self.files,
            Phase::Settings => &self.settings,
        };
        Ok(pages.get(index).cloned().unwrap_or_default())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}
