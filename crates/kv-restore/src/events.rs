use std::sync::{Mutex, mpsc};
use std::time::Instant;

use crate::task::{DriverMode, TaskRecord, TaskStatus};

#[derive(Debug, Clone)]
pub enum RestoreEvent {
    TaskCreated {
        id: String,
        mode: DriverMode,
        total_files: usize,
        total_settings: usize,
    },
    StepFinished {
        id: String,
        status: TaskStatus,
        progress: u8,
        processed: usize,
        elapsed_ms: u128,
    },
    TaskFinished {
        id: String,
        status: TaskStatus,
        restored_files: usize,
        failed_files: usize,
        restored_settings: usize,
        failed_settings: usize,
        last_error: Option<String>,
    },
}

impl RestoreEvent {
    pub fn finished(rec: &TaskRecord) -> Self {
        Self::TaskFinished {
            id: rec.id.clone(),
            status: rec.status,
            restored_files: rec.restored_files,
            failed_files: rec.failed_files,
            restored_settings: rec.restored_settings,
            failed_settings: rec.failed_settings,
            last_error: (!rec.last_error.is_empty()).then(|| rec.last_error.clone()),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ev: RestoreEvent);
}

#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _ev: RestoreEvent) {}
}

/// Line-oriented progress output for the CLI.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    steps: usize,
    entries: usize,
}

impl StdoutSink {
    /// Update the running totals and format the lines printed for `ev`.
    fn render(&self, ev: RestoreEvent) -> String {
        match ev {
            RestoreEvent::TaskCreated {
                id,
                mode,
                total_files,
                total_settings,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    *s = StdoutSinkState {
                        started_at: Some(Instant::now()),
                        ..Default::default()
                    };
                }
                let mode = match mode {
                    DriverMode::Polled => "polled",
                    DriverMode::RunToCompletion => "run_to_completion",
                };
                format!("CREATE: {id} ({mode}) files={total_files} settings={total_settings}\n")
            }
            RestoreEvent::StepFinished {
                id,
                status,
                progress,
                processed,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.steps = s.steps.saturating_add(1);
                    s.entries = s.entries.saturating_add(processed);
                }
                format!("STEP: {id} {status} {progress:>3}% (+{processed} in {elapsed_ms}ms)\n")
            }
            RestoreEvent::TaskFinished {
                id,
                status,
                restored_files,
                failed_files,
                restored_settings,
                failed_settings,
                last_error,
            } => {
                let mut out = format!("DONE: {id} {status}\n");
                if let Ok(s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    out.push_str("SUMMARY:\n");
                    out.push_str(&format!(
                        "  files: restored={restored_files} failed={failed_files}\n"
                    ));
                    out.push_str(&format!(
                        "  settings: restored={restored_settings} failed={failed_settings}\n"
                    ));
                    out.push_str(&format!("  steps: {} entries: {}\n", s.steps, s.entries));
                    out.push_str(&format!("  elapsed: {}ms\n", wall.as_millis()));
                }
                if let Some(e) = last_error {
                    out.push_str(&format!("  last_error: {e}\n"));
                }
                out
            }
        }
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, ev: RestoreEvent) {
        print!("{}", self.render(ev));
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RestoreEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RestoreEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: RestoreEvent) {
        let _ = self.tx.send(ev);
    }
}
