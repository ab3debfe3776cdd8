use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use kv_restore::ErrorKind;
use kv_restore::config::{ConfigDoc, RestoreConfig};
use kv_restore::decode::decode_payload;
use kv_restore::driver::{INTERRUPTED_ERROR, Restorer};
use kv_restore::events::{ChannelSink, NullSink, RestoreEvent};
use kv_restore::export::{ExportOptions, export_snapshot};
use kv_restore::kv::{FsStore, KeyValueStore, MemoryStore, StoredValue};
use kv_restore::lease;
use kv_restore::snapshot::{FileEntry, Snapshot};
use kv_restore::task::{ChunkLayout, DriverMode, Keys, TaskRecord, TaskStatus};
use serde_json::json;

fn restore_config(toml: &str) -> RestoreConfig {
    ConfigDoc::parse(toml)
        .expect("parse config")
        .settings()
        .expect("settings")
        .restore
}

fn polled() -> RestoreConfig {
    restore_config(
        r#"
[restore]
chunk_size = 20
quantum = 20
"#,
    )
}

fn snapshot(files: usize, settings: usize) -> Snapshot {
    let mut s = Snapshot {
        timestamp: 1_700_000_000_000,
        version: "2.2.5".into(),
        ..Default::default()
    };
    for i in 0..files {
        s.files.insert(
            format!("file-{i:03}.bin"),
            FileEntry::metadata_only(json!({ "Channel": "Telegram", "n": i })),
        );
    }
    for i in 0..settings {
        s.settings
            .insert(format!("manage@setting-{i}"), json!({ "v": i }));
    }
    s
}

/// Memory store that refuses `put` for keys matching a predicate, optionally only
/// after a number of successful matching writes.
struct FlakyStore {
    inner: MemoryStore,
    fails: fn(&str) -> bool,
    allow_first: usize,
    seen: AtomicUsize,
}

impl FlakyStore {
    fn new(fails: fn(&str) -> bool, allow_first: usize) -> Self {
        Self {
            inner: MemoryStore::default(),
            fails,
            allow_first,
            seen: AtomicUsize::new(0),
        }
    }
}

impl KeyValueStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }
    fn get_with_metadata(&self, key: &str) -> kv_restore::Result<Option<StoredValue>> {
        self.inner.get_with_metadata(key)
    }
    fn put(
        &self,
        key: &str,
        value: &str,
        metadata: Option<&serde_json::Value>,
    ) -> kv_restore::Result<()> {
        if (self.fails)(key) && self.seen.fetch_add(1, Ordering::SeqCst) >= self.allow_first {
            return Err(kv_restore::Error::storage(format!("write refused: {key}")));
        }
        self.inner.put(key, value, metadata)
    }
    fn put_if_absent(&self, key: &str, value: &str) -> kv_restore::Result<bool> {
        self.inner.put_if_absent(key, value)
    }
    fn delete(&self, key: &str) -> kv_restore::Result<()> {
        self.inner.delete(key)
    }
    fn remove_if(
        &self,
        key: &str,
        pred: &dyn Fn(Option<&StoredValue>) -> bool,
    ) -> kv_restore::Result<bool> {
        self.inner.remove_if(key, pred)
    }
    fn list(&self, prefix: &str) -> kv_restore::Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

/// Memory store whose first read of a key ending in `fail_suffix` errors, and which
/// counts every `put` per key.
struct ObservedStore {
    inner: MemoryStore,
    fail_suffix: Option<&'static str>,
    failed: AtomicBool,
    puts: Mutex<BTreeMap<String, usize>>,
}

impl ObservedStore {
    fn new(fail_suffix: Option<&'static str>) -> Self {
        Self {
            inner: MemoryStore::default(),
            fail_suffix,
            failed: AtomicBool::new(false),
            puts: Mutex::new(BTreeMap::new()),
        }
    }

    fn puts_outside(&self, prefix: &str) -> BTreeMap<String, usize> {
        let puts = self.puts.lock().unwrap();
        puts.iter()
            .filter(|(k, _)| !k.starts_with(prefix))
            .map(|(k, n)| (k.clone(), *n))
            .collect()
    }
}

impl KeyValueStore for ObservedStore {
    fn name(&self) -> &str {
        "observed"
    }
    fn get_with_metadata(&self, key: &str) -> kv_restore::Result<Option<StoredValue>> {
        if let Some(suffix) = self.fail_suffix
            && key.ends_with(suffix)
            && !self.failed.swap(true, Ordering::SeqCst)
        {
            return Err(kv_restore::Error::storage(format!("read timed out: {key}")));
        }
        self.inner.get_with_metadata(key)
    }
    fn put(
        &self,
        key: &str,
        value: &str,
        metadata: Option<&serde_json::Value>,
    ) -> kv_restore::Result<()> {
        *self.puts.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.put(key, value, metadata)
    }
    fn put_if_absent(&self, key: &str, value: &str) -> kv_restore::Result<bool> {
        self.inner.put_if_absent(key, value)
    }
    fn delete(&self, key: &str) -> kv_restore::Result<()> {
        self.inner.delete(key)
    }
    fn remove_if(
        &self,
        key: &str,
        pred: &dyn Fn(Option<&StoredValue>) -> bool,
    ) -> kv_restore::Result<bool> {
        self.inner.remove_if(key, pred)
    }
    fn list(&self, prefix: &str) -> kv_restore::Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

#[test]
fn polled_restore_steps_to_completion() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let r = Restorer::new(Arc::clone(&store), polled(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(45, 5)).unwrap();
    assert_eq!(created.total_files, 45);
    assert_eq!(created.total_settings, 5);
    assert_eq!(
        store.list(&format!("restore@chunk@{}@", created.task_id)).unwrap().len(),
        4
    );

    let mut seen = Vec::new();
    loop {
        let rec = r.get_status(&created.task_id).unwrap();
        seen.push(rec.progress);
        if rec.is_terminal() {
            assert_eq!(rec.status, TaskStatus::Completed);
            assert_eq!(rec.restored_files, 45);
            assert_eq!(rec.restored_settings, 5);
            break;
        }
        assert!(seen.len() < 10, "task never finished");
    }
    assert_eq!(seen, vec![40, 80, 100]);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    assert!(store.list("restore@chunk@").unwrap().is_empty());
    assert!(store.list("restore@lease@").unwrap().is_empty());
    assert_eq!(store.get("manage@setting-3").unwrap().as_deref(), Some(r#"{"v":3}"#));
    assert_eq!(
        store.metadata("file-007.bin").unwrap(),
        Some(json!({ "Channel": "Telegram", "n": 7 }))
    );

    // Terminal queries do not write.
    let before = r.get_status(&created.task_id).unwrap();
    let after = r.get_status(&created.task_id).unwrap();
    assert_eq!(before, after);
}

#[test]
fn step_count_matches_quantum() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let cfg = restore_config("[restore]\nchunk_size = 8\nquantum = 20\n");
    let r = Restorer::new(store, cfg, Arc::new(NullSink));
    let created = r.create_restore(snapshot(90, 11)).unwrap();

    let mut steps = 0;
    while !r.get_status(&created.task_id).unwrap().is_terminal() {
        steps += 1;
    }
    // ceil(101 / 20) steps, the last of which reports the terminal status.
    assert_eq!(steps + 1, 6);
}

#[test]
fn failing_file_write_completes_with_errors() {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FlakyStore::new(|k| k == "file-002.bin", 0));
    let r = Restorer::new(Arc::clone(&store), polled(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(3, 1)).unwrap();

    let rec = r.drive_to_completion(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::CompletedWithErrors);
    assert_eq!(rec.failed_files, 1);
    assert_eq!(rec.restored_files, 2);
    assert_eq!(rec.restored_settings, 1);
    assert_eq!(rec.progress, 100);
    assert!(rec.last_error.contains("file-002.bin"), "{}", rec.last_error);
}

#[test]
fn unknown_and_malformed_ids_are_not_found() {
    let r = Restorer::new(
        Arc::new(MemoryStore::default()),
        polled(),
        Arc::new(NullSink),
    );
    let err = r.get_status("1700000000000-deadbeef").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = r.get_status("../../etc/passwd").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn missing_settings_is_rejected_before_any_task_exists() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let body = br#"{"timestamp":1,"version":"2.2.5","data":{"files":{}}}"#;
    let err = decode_payload("application/json", body).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(store.list("").unwrap().is_empty());

    let err = decode_payload("application/xml", body).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn chunk_persist_failure_leaves_nothing_behind() {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FlakyStore::new(|k| k.contains("@chunk@"), 1));
    let r = Restorer::new(Arc::clone(&store), polled(), Arc::new(NullSink));
    let err = r.create_restore(snapshot(45, 5)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(store.list("restore@").unwrap().is_empty());
    assert!(r.list_tasks().unwrap().is_empty());
}

#[test]
fn record_persist_failure_drops_stored_chunks() {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FlakyStore::new(|k| k.starts_with("restore@task@"), 0));
    let r = Restorer::new(Arc::clone(&store), polled(), Arc::new(NullSink));
    assert!(r.create_restore(snapshot(5, 1)).is_err());
    assert!(store.list("restore@").unwrap().is_empty());
}

#[test]
fn polled_task_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let task_id = {
        let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        let r = Restorer::new(store, polled(), Arc::new(NullSink));
        let created = r.create_restore(snapshot(45, 5)).unwrap();
        let rec = r.get_status(&created.task_id).unwrap();
        assert_eq!(rec.status, TaskStatus::Running);
        assert_eq!(rec.restored_files, 20);
        created.task_id
    };

    let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::open(dir.path()).unwrap());
    let r = Restorer::new(Arc::clone(&store), polled(), Arc::new(NullSink));
    let rec = r.drive_to_completion(&task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Completed);
    assert_eq!(rec.restored_files, 45);
    assert_eq!(rec.restored_settings, 5);
    assert!(store.get("file-044.bin").unwrap().is_some());
    assert!(store.list("restore@chunk@").unwrap().is_empty());
}

#[test]
fn failed_chunk_read_is_retried_on_next_poll() {
    let store = Arc::new(ObservedStore::new(Some("@files@1")));
    let r = Restorer::new(store.clone(), polled(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(45, 5)).unwrap();

    let rec = r.get_status(&created.task_id).unwrap();
    assert_eq!(rec.restored_files, 20);
    let rec = r.get_status(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Running);
    assert_eq!(rec.restored_files, 20);
    assert!(rec.last_error.is_empty(), "{}", rec.last_error);

    let rec = r.drive_to_completion(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Completed);
    assert_eq!(rec.restored_files, 45);
    assert_eq!(rec.restored_settings, 5);
    assert!(store.failed.load(Ordering::SeqCst));
}

#[test]
fn concurrent_polling_restores_each_entry_once() {
    let store = Arc::new(ObservedStore::new(None));
    let r = Restorer::new(store.clone(), polled(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(45, 5)).unwrap();

    let finals: Vec<TaskRecord> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    loop {
                        let rec = r.get_status(&created.task_id).unwrap();
                        if rec.is_terminal() {
                            return rec;
                        }
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for rec in &finals {
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.restored_files, 45);
        assert_eq!(rec.restored_settings, 5);
        assert_eq!(rec.failed_files + rec.failed_settings, 0);
        assert_eq!(rec.progress, 100);
        // Creation plus exactly three steps of 20, 20 and 10 entries.
        assert_eq!(rec.revision, 4);
    }

    let puts = store.puts_outside("restore@");
    assert_eq!(puts.len(), 50);
    assert!(puts.values().all(|n| *n == 1), "{puts:?}");
    assert!(store.list("restore@lease@").unwrap().is_empty());
    assert!(store.list("restore@chunk@").unwrap().is_empty());
}

#[test]
fn exported_backup_restores_identical_values() {
    let source = MemoryStore::default();
    source
        .put("manage@x", r#"{"zeta": 1, "alpha": 2}"#, None)
        .unwrap();
    source.put("manage@theme", "dark", None).unwrap();
    source
        .put("pic.png", "", Some(&json!({ "Channel": "Telegram", "Size": 12 })))
        .unwrap();

    let snap = export_snapshot(&source, &ExportOptions::default()).unwrap();
    let wire = serde_json::to_string(&snap.to_document()).unwrap();
    let snap = Snapshot::from_json_str(&wire).unwrap();

    let target: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let r = Restorer::new(Arc::clone(&target), polled(), Arc::new(NullSink));
    let created = r.create_restore(snap).unwrap();
    let rec = r.drive_to_completion(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Completed);

    assert_eq!(
        target.get("manage@x").unwrap().as_deref(),
        Some(r#"{"zeta": 1, "alpha": 2}"#)
    );
    assert_eq!(target.get("manage@theme").unwrap().as_deref(), Some("dark"));
    assert_eq!(
        target.metadata("pic.png").unwrap(),
        Some(json!({ "Channel": "Telegram", "Size": 12 }))
    );
}

#[test]
fn torn_lease_file_does_not_wedge_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::open(dir.path()).unwrap());
    let cfg = polled();
    let r = Restorer::new(Arc::clone(&store), cfg.clone(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(30, 2)).unwrap();

    // A driver crashed between creating its lease file and writing it.
    let keys = Keys::new(cfg.key_prefix.clone());
    let lease_file = dir.path().join(format!(
        "{}.json",
        hex::encode(keys.lease(&created.task_id).as_bytes())
    ));
    std::fs::write(&lease_file, "").unwrap();

    let rec = r.drive_to_completion(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Completed);
    assert_eq!(rec.restored_files, 30);
    assert!(!lease_file.exists());
}

#[test]
fn leased_task_is_not_stepped() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let cfg = polled();
    let r = Restorer::new(Arc::clone(&store), cfg.clone(), Arc::new(NullSink));
    let created = r.create_restore(snapshot(30, 0)).unwrap();

    let keys = Keys::new(cfg.key_prefix.clone());
    let held = lease::try_acquire(&store, &keys, &created.task_id, cfg.lease_ttl_secs)
        .unwrap()
        .expect("lease");
    let rec = r.get_status(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Queued);
    assert_eq!(rec.revision, 1);

    drop(held);
    let rec = r.get_status(&created.task_id).unwrap();
    assert_eq!(rec.status, TaskStatus::Running);
    assert_eq!(rec.restored_files, 20);
}

#[test]
fn run_to_completion_finishes_in_background() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let cfg = restore_config(
        r#"
[restore]
mode = "run_to_completion"
chunk_size = 7
checkpoint_every = 10
"#,
    );
    let (tx, rx) = mpsc::channel();
    let r = Restorer::new(Arc::clone(&store), cfg, Arc::new(ChannelSink::new(tx)));
    let created = r.create_restore(snapshot(33, 4)).unwrap();
    assert!(store.list("restore@chunk@").unwrap().is_empty());

    let rec = r.wait(&created.task_id).unwrap();
    assert_eq!(rec.mode, DriverMode::RunToCompletion);
    assert_eq!(rec.status, TaskStatus::Completed);
    assert_eq!(rec.restored_files + rec.restored_settings, 37);
    assert!(store.list("restore@lease@").unwrap().is_empty());

    // A run-mode status query only observes.
    assert_eq!(r.get_status(&created.task_id).unwrap(), rec);

    drop(r);
    let events: Vec<_> = rx.iter().collect();
    let checkpoints = events
        .iter()
        .filter(|e| matches!(e, RestoreEvent::StepFinished { .. }))
        .count();
    assert_eq!(checkpoints, 4);
    assert!(matches!(
        events.last(),
        Some(RestoreEvent::TaskFinished {
            status: TaskStatus::Completed,
            ..
        })
    ));
}

#[test]
fn interrupted_run_mode_task_is_marked_failed() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let cfg = restore_config("[restore]\nmode = \"run_to_completion\"\n");
    let keys = Keys::new(cfg.key_prefix.clone());

    let layout = ChunkLayout {
        total_files: 10,
        total_settings: 0,
        file_chunks: 1,
        setting_chunks: 0,
    };
    let mut orphan = TaskRecord::new("orphan-1".into(), DriverMode::RunToCompletion, layout, 0);
    orphan.status = TaskStatus::Running;
    orphan.restored_files = 4;
    store
        .put(&keys.task("orphan-1"), &serde_json::to_string(&orphan).unwrap(), None)
        .unwrap();

    let r = Restorer::new(Arc::clone(&store), cfg, Arc::new(NullSink));
    assert_eq!(r.recover_interrupted().unwrap(), vec!["orphan-1".to_string()]);
    let rec = r.get_status("orphan-1").unwrap();
    assert_eq!(rec.status, TaskStatus::Failed);
    assert_eq!(rec.last_error, INTERRUPTED_ERROR);
    assert_eq!(rec.restored_files, 4);

    assert!(r.recover_interrupted().unwrap().is_empty());
}
