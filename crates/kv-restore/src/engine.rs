use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::chunks::ChunkSource;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventSink, RestoreEvent};
use crate::kv::KeyValueStore;
use crate::sanitize::sanitize_error_text;
use crate::snapshot::FileEntry;
use crate::task::{Cursor, Keys, Phase, TaskRecord, TaskStatus};

/// Advances task records. The engine is the only writer of task records; every
/// mutation goes through `run_quantum` followed by `persist`.
pub struct RestoreEngine {
    store: Arc<dyn KeyValueStore>,
    keys: Keys,
    quantum: usize,
    sink: Arc<dyn EventSink>,
}

impl RestoreEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: Keys,
        quantum: usize,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            keys,
            quantum: quantum.max(1),
            sink,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn load(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let key = self.keys.task(task_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::storage(format!("corrupt task record '{key}': {e}")))
    }

    /// Checkpoint: progress is always recomputed from the counters before writing.
    pub fn persist(&self, task: &mut TaskRecord) -> Result<()> {
        task.recompute_progress();
        task.revision = task.revision.saturating_add(1);
        task.updated_at = Utc::now();
        let body = serde_json::to_string(task)
            .map_err(|e| Error::storage(format!("task record encode failed: {e}")))?;
        self.store.put(&self.keys.task(&task.id), &body, None)
    }

    /// One bounded step: at most `quantum` entries, then a checkpoint. Terminal
    /// records come back unchanged without touching the store. A store error while
    /// reading chunks is returned without a checkpoint, so the caller keeps the
    /// previous record and the step is redone later.
    pub fn step(&self, task: TaskRecord, source: &dyn ChunkSource) -> Result<TaskRecord> {
        if task.is_terminal() {
            return Ok(task);
        }
        let mut task = task;
        let started = Instant::now();
        let processed = self.run_quantum(&mut task, source, self.quantum)?;
        self.persist(&mut task)?;
        self.report(&task, processed, started);
        if task.is_terminal() {
            self.release(&task, source);
        }
        Ok(task)
    }

    /// Drop the chunks of a terminal task. Callers checkpoint the terminal record first.
    pub(crate) fn release(&self, task: &TaskRecord, source: &dyn ChunkSource) {
        if let Err(e) = source.release() {
            warn!(task_id = %task.id, error = %e, "failed to delete task chunks");
        }
    }

    /// Process up to `budget` entries and settle the status. Per-entry errors are
    /// counted; missing or corrupt chunks fail the task. Only store errors while
    /// reading a chunk are returned, leaving `task` partly advanced: discard it.
    pub fn run_quantum(
        &self,
        task: &mut TaskRecord,
        source: &dyn ChunkSource,
        budget: usize,
    ) -> Result<usize> {
        if task.is_terminal() {
            return Ok(0);
        }
        if task.status == TaskStatus::Queued {
            task.status = TaskStatus::Running;
            debug!(task_id = %task.id, "task running");
        }

        let processed = match self.advance(task, source, budget) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Storage => {
                warn!(task_id = %task.id, error = %e, "chunk read failed; step will be retried");
                return Err(e);
            }
            Err(e) => {
                let msg = sanitize_error_text(&e.to_string());
                warn!(task_id = %task.id, error = %msg, "restore step failed");
                task.fail(msg);
                0
            }
        };

        if !task.is_terminal() {
            if task.entries_exhausted() {
                task.finish();
            } else if processed < budget {
                // Cursor ran off the end without accounting for every entry.
                let missing = task
                    .total()
                    .saturating_sub(task.processed_files() + task.processed_settings());
                task.fail(format!(
                    "snapshot chunks missing: {missing} entries could not be read"
                ));
                warn!(task_id = %task.id, missing, "restore ended with unread entries");
            }
        }

        if task.is_terminal() {
            info!(
                task_id = %task.id,
                status = %task.status,
                restored_files = task.restored_files,
                failed_files = task.failed_files,
                restored_settings = task.restored_settings,
                failed_settings = task.failed_settings,
                "restore finished"
            );
        }
        Ok(processed)
    }

    pub(crate) fn report(&self, task: &TaskRecord, processed: usize, started: Instant) {
        debug!(
            task_id = %task.id,
            phase = %task.cursor.phase,
            progress = task.progress,
            processed,
            "step checkpointed"
        );
        self.sink.emit(RestoreEvent::StepFinished {
            id: task.id.clone(),
            status: task.status,
            progress: task.progress,
            processed,
            elapsed_ms: started.elapsed().as_millis(),
        });
        if task.is_terminal() {
            self.sink.emit(RestoreEvent::finished(task));
        }
    }

    /// Walk the cursor forward, files then settings, applying at most `budget` entries.
    fn advance(
        &self,
        task: &mut TaskRecord,
        source: &dyn ChunkSource,
        budget: usize,
    ) -> Result<usize> {
        let mut processed = 0usize;
        while processed < budget {
            let phase = task.cursor.phase;
            let phase_done = match phase {
                Phase::Files => {
                    task.cursor.chunk_index >= task.file_chunks
                        || task.processed_files() >= task.total_files
                }
                Phase::Settings => {
                    task.cursor.chunk_index >= task.setting_chunks
                        || task.processed_settings() >= task.total_settings
                }
            };
            if phase_done {
                match phase {
                    Phase::Files => {
                        task.cursor = Cursor::start_of(Phase::Settings);
                        continue;
                    }
                    Phase::Settings => break,
                }
            }

            let entries = source.chunk(phase, task.cursor.chunk_index)?;
            for (key, value) in entries.iter().skip(task.cursor.index_within_chunk) {
                if processed >= budget {
                    break;
                }
                self.apply_entry(task, phase, key, value);
                task.cursor.index_within_chunk += 1;
                processed += 1;
            }
            if task.cursor.index_within_chunk >= entries.len() {
                task.cursor.chunk_index += 1;
                task.cursor.index_within_chunk = 0;
            }
        }
        Ok(processed)
    }

    fn apply_entry(&self, task: &mut TaskRecord, phase: Phase, key: &str, value: &serde_json::Value) {
        let res = match phase {
            Phase::Files => self.write_file(key, value),
            Phase::Settings => self.write_setting(key, value),
        };
        match (phase, res) {
            (Phase::Files, Ok(())) => task.restored_files += 1,
            (Phase::Settings, Ok(())) => task.restored_settings += 1,
            (phase, Err(e)) => {
                let msg = sanitize_error_text(&format!("{phase} '{key}': {e}"));
                warn!(task_id = %task.id, %phase, key, error = %msg, "entry restore failed");
                match phase {
                    Phase::Files => task.failed_files += 1,
                    Phase::Settings => task.failed_settings += 1,
                }
                task.last_error = msg;
            }
        }
    }

    fn write_file(&self, key: &str, raw: &serde_json::Value) -> Result<()> {
        let entry: FileEntry = serde_json::from_value(raw.clone())
            .map_err(|e| Error::validation(format!("invalid file entry: {e}")))?;
        let metadata = (!entry.metadata.is_null()).then_some(&entry.metadata);
        match entry.value.as_deref().filter(|v| !v.is_empty()) {
            Some(payload) => self.store.put(key, payload, metadata),
            // Metadata-only entries restore as an empty placeholder.
            None => self.store.put(key, "", metadata),
        }
    }

    fn write_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        match value {
            serde_json::Value::String(s) => self.store.put(key, s, None),
            other => self.store.put(key, &other.to_string(), None),
        }
    }
}
