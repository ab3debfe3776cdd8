use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::chunks::{ChunkStore, InMemoryChunks, PersistedChunks};
use crate::config::RestoreConfig;
use crate::engine::RestoreEngine;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EventSink, RestoreEvent};
use crate::kv::KeyValueStore;
use crate::lease::{self, LeaseGuard};
use crate::sanitize::sanitize_error_text;
use crate::snapshot::Snapshot;
use crate::task::{DriverMode, Keys, TaskRecord, is_valid_task_id, new_task_id};

pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRestore {
    pub task_id: String,
    pub total_files: usize,
    pub total_settings: usize,
}

/// Creates restore tasks and decides when their steps run.
///
/// In polled mode every `get_status` call performs one bounded step. In
/// run-to-completion mode `create_restore` starts a background worker and
/// `get_status` only observes.
pub struct Restorer {
    engine: Arc<RestoreEngine>,
    chunks: ChunkStore,
    cfg: RestoreConfig,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Restorer {
    pub fn new(store: Arc<dyn KeyValueStore>, cfg: RestoreConfig, sink: Arc<dyn EventSink>) -> Self {
        let keys = Keys::new(cfg.key_prefix.clone());
        let chunks = ChunkStore::new(Arc::clone(&store), keys.clone(), cfg.chunk_size);
        let engine = Arc::new(RestoreEngine::new(store, keys, cfg.quantum, sink));
        Self {
            engine,
            chunks,
            cfg,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> DriverMode {
        self.cfg.mode
    }

    pub fn engine(&self) -> &RestoreEngine {
        &self.engine
    }

    pub fn create_restore(&self, snapshot: Snapshot) -> Result<CreatedRestore> {
        let task_id = new_task_id();
        let rec = match self.cfg.mode {
            DriverMode::Polled => self.create_polled(&task_id, &snapshot)?,
            DriverMode::RunToCompletion => self.create_background(&task_id, &snapshot)?,
        };
        info!(
            task_id = %rec.id,
            mode = ?rec.mode,
            total_files = rec.total_files,
            total_settings = rec.total_settings,
            backup_timestamp = rec.backup_timestamp,
            "restore task created"
        );
        Ok(CreatedRestore {
            task_id: rec.id,
            total_files: rec.total_files,
            total_settings: rec.total_settings,
        })
    }

    fn create_polled(&self, task_id: &str, snapshot: &Snapshot) -> Result<TaskRecord> {
        let layout = self.chunks.store(task_id, snapshot)?;
        let mut rec = TaskRecord::new(
            task_id.to_string(),
            DriverMode::Polled,
            layout,
            snapshot.timestamp,
        );
        if let Err(e) = self.engine.persist(&mut rec) {
            if let Err(cleanup) = self.chunks.delete_all(task_id) {
                warn!(task_id, error = %cleanup, "failed to clean up chunks of uncreated task");
            }
            return Err(Error::storage(format!("failed to create restore task: {e}")));
        }
        self.emit_created(&rec);
        Ok(rec)
    }

    fn create_background(&self, task_id: &str, snapshot: &Snapshot) -> Result<TaskRecord> {
        let (pages, layout) = InMemoryChunks::new(snapshot, self.chunks.chunk_size())?;
        let mut rec = TaskRecord::new(
            task_id.to_string(),
            DriverMode::RunToCompletion,
            layout,
            snapshot.timestamp,
        );
        let lease = lease::try_acquire(
            self.engine.store(),
            self.engine.keys(),
            task_id,
            self.cfg.lease_ttl_secs,
        )?
        .ok_or_else(|| Error::new(ErrorKind::Busy, format!("task '{task_id}' is leased")))?;
        self.engine
            .persist(&mut rec)
            .map_err(|e| Error::storage(format!("failed to create restore task: {e}")))?;
        self.emit_created(&rec);

        let engine = Arc::clone(&self.engine);
        let every = self.cfg.checkpoint_every;
        let worker_rec = rec.clone();
        let handle = std::thread::Builder::new()
            .name(format!("restore-{task_id}"))
            .spawn(move || run_to_completion(&engine, worker_rec, &pages, every, lease))
            .map_err(|e| Error::msg(format!("failed to spawn restore worker: {e}")))?;
        if let Ok(mut w) = self.workers.lock() {
            w.retain(|_, h| !h.is_finished());
            w.insert(task_id.to_string(), handle);
        }
        Ok(rec)
    }

    fn emit_created(&self, rec: &TaskRecord) {
        self.engine.sink().emit(RestoreEvent::TaskCreated {
            id: rec.id.clone(),
            mode: rec.mode,
            total_files: rec.total_files,
            total_settings: rec.total_settings,
        });
    }

    /// Latest record for `task_id`. Polled tasks advance by one step first, unless
    /// another driver holds the task lease.
    pub fn get_status(&self, task_id: &str) -> Result<TaskRecord> {
        let rec = self.load_existing(task_id)?;
        if rec.is_terminal() || rec.mode != DriverMode::Polled {
            return Ok(rec);
        }

        let guard = match lease::try_acquire(
            self.engine.store(),
            self.engine.keys(),
            task_id,
            self.cfg.lease_ttl_secs,
        ) {
            Ok(Some(g)) => g,
            Ok(None) => return Ok(rec),
            Err(e) => {
                warn!(task_id, error = %e, "lease unavailable; returning last record");
                return Ok(rec);
            }
        };

        // Reload under the lease: another driver may have stepped since the first read.
        let rec = match self.engine.load(task_id) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return Err(Error::not_found(format!("task '{task_id}' not found"))),
            Err(e) => {
                warn!(task_id, error = %e, "task reload failed; returning last record");
                return Ok(rec);
            }
        };
        let source = PersistedChunks::new(&self.chunks, task_id);
        let out = match self.engine.step(rec.clone(), &source) {
            Ok(next) => next,
            Err(e) => {
                warn!(task_id, error = %e, "step failed; returning last record");
                rec
            }
        };
        drop(guard);
        Ok(out)
    }

    fn load_existing(&self, task_id: &str) -> Result<TaskRecord> {
        if !is_valid_task_id(task_id) {
            return Err(Error::not_found(format!("task '{task_id}' not found")));
        }
        self.engine
            .load(task_id)?
            .ok_or_else(|| Error::not_found(format!("task '{task_id}' not found")))
    }

    /// Every task record under the key prefix, oldest first.
    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let prefix = self.engine.keys().tasks_prefix();
        let mut out = Vec::new();
        for key in self.engine.store().list(&prefix)? {
            let id = &key[prefix.len()..];
            match self.engine.load(id) {
                Ok(Some(rec)) => out.push(rec),
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "skipping unreadable task record"),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Block until the background worker for `task_id` exits. Returns the final record.
    pub fn wait(&self, task_id: &str) -> Result<TaskRecord> {
        let handle = self.workers.lock().ok().and_then(|mut w| w.remove(task_id));
        if let Some(h) = handle {
            h.join()
                .map_err(|p| Error::msg(format!("restore worker '{task_id}' panicked: {p:?}")))?;
        }
        self.load_existing(task_id)
    }

    /// Drive a task until it reaches a terminal status, whatever the mode.
    pub fn drive_to_completion(&self, task_id: &str) -> Result<TaskRecord> {
        if self.cfg.mode == DriverMode::RunToCompletion {
            return self.wait(task_id);
        }
        let mut last_revision = None;
        loop {
            let rec = self.get_status(task_id)?;
            if rec.is_terminal() {
                return Ok(rec);
            }
            if rec.mode != DriverMode::Polled {
                return self.wait(task_id);
            }
            // Someone else holds the lease; give them a moment.
            if last_revision == Some(rec.revision) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            last_revision = Some(rec.revision);
        }
    }

    /// Run-to-completion tasks keep their snapshot in memory and cannot resume after a
    /// restart. Mark every such task that no live worker owns as failed.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for rec in self.list_tasks()? {
            if rec.is_terminal() || rec.mode != DriverMode::RunToCompletion {
                continue;
            }
            let running_here = self
                .workers
                .lock()
                .map(|w| w.get(&rec.id).is_some_and(|h| !h.is_finished()))
                .unwrap_or(false);
            if running_here {
                continue;
            }
            let Some(_guard) = lease::try_acquire(
                self.engine.store(),
                self.engine.keys(),
                &rec.id,
                self.cfg.lease_ttl_secs,
            )?
            else {
                continue;
            };
            let mut rec = rec;
            rec.fail(INTERRUPTED_ERROR);
            self.engine.persist(&mut rec)?;
            self.engine.sink().emit(RestoreEvent::finished(&rec));
            warn!(task_id = %rec.id, "marked interrupted restore as failed");
            recovered.push(rec.id);
        }
        Ok(recovered)
    }
}

/// Background loop: same per-entry logic as a polled step, checkpointing every
/// `every` entries instead of once per step. Stops without writing once the lease is
/// lost or someone else has settled the record.
fn run_to_completion(
    engine: &RestoreEngine,
    mut rec: TaskRecord,
    pages: &InMemoryChunks,
    every: usize,
    lease: LeaseGuard,
) {
    while !rec.is_terminal() {
        let started = Instant::now();
        let processed = match engine.run_quantum(&mut rec, pages, every) {
            Ok(n) => n,
            Err(e) => {
                rec.fail(sanitize_error_text(&e.to_string()));
                0
            }
        };
        if !still_owned(engine, &lease, &rec.id) {
            return;
        }
        if let Err(e) = engine.persist(&mut rec) {
            error!(task_id = %rec.id, error = %e, "checkpoint failed; aborting restore");
            rec.fail(sanitize_error_text(&format!("checkpoint failed: {e}")));
            if let Err(e) = engine.persist(&mut rec) {
                error!(task_id = %rec.id, error = %e, "failed to record restore failure");
            }
            engine.report(&rec, processed, started);
            return;
        }
        engine.report(&rec, processed, started);
        if rec.is_terminal() {
            engine.release(&rec, pages);
        }
    }
}

/// Renew the lease and confirm the stored record is still open before a checkpoint.
fn still_owned(engine: &RestoreEngine, lease: &LeaseGuard, task_id: &str) -> bool {
    match lease.renew() {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::Busy => {
            warn!(task_id, error = %e, "task lease lost; stopping restore worker");
            return false;
        }
        Err(e) => warn!(task_id, error = %e, "failed to renew task lease"),
    }
    match engine.load(task_id) {
        Ok(Some(stored)) if stored.is_terminal() => {
            warn!(task_id, status = %stored.status, "task settled elsewhere; stopping restore worker");
            false
        }
        Ok(_) => true,
        Err(e) => {
            warn!(task_id, error = %e, "failed to reload task record");
            true
        }
    }
}
