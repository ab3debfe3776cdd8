use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Which driver advances a task. Polled tasks resume on the next status query;
/// run-to-completion tasks hold their snapshot in memory and cannot resume.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    #[default]
    Polled,
    RunToCompletion,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Files,
    Settings,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub phase: Phase,
    pub chunk_index: usize,
    pub index_within_chunk: usize,
}

impl Cursor {
    pub fn start_of(phase: Phase) -> Self {
        Self {
            phase,
            chunk_index: 0,
            index_within_chunk: 0,
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start_of(Phase::Files)
    }
}

/// Chunk counts produced when a snapshot is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkLayout {
    pub total_files: usize,
    pub total_settings: usize,
    pub file_chunks: usize,
    pub setting_chunks: usize,
}

impl ChunkLayout {
    pub fn chunks_for(self, phase: Phase) -> usize {
        match phase {
            Phase::Files => self.file_chunks,
            Phase::Settings => self.setting_chunks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub mode: DriverMode,
    pub total_files: usize,
    pub total_settings: usize,
    pub file_chunks: usize,
    pub setting_chunks: usize,
    pub restored_files: usize,
    pub restored_settings: usize,
    pub failed_files: usize,
    pub failed_settings: usize,
    pub cursor: Cursor,
    #[serde(default)]
    pub last_error: String,
    pub progress: u8,
    #[serde(default)]
    pub backup_timestamp: i64,
    /// Bumped on every persist.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: String, mode: DriverMode, layout: ChunkLayout, backup_timestamp: i64) -> Self {
        let now = Utc::now();
        let mut rec = Self {
            id,
            status: TaskStatus::Queued,
            mode,
            total_files: layout.total_files,
            total_settings: layout.total_settings,
            file_chunks: layout.file_chunks,
            setting_chunks: layout.setting_chunks,
            restored_files: 0,
            restored_settings: 0,
            failed_files: 0,
            failed_settings: 0,
            cursor: Cursor::default(),
            last_error: String::new(),
            progress: 0,
            backup_timestamp,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        rec.recompute_progress();
        rec
    }

    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            total_files: self.total_files,
            total_settings: self.total_settings,
            file_chunks: self.file_chunks,
            setting_chunks: self.setting_chunks,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn processed_files(&self) -> usize {
        self.restored_files + self.failed_files
    }

    pub fn processed_settings(&self) -> usize {
        self.restored_settings + self.failed_settings
    }

    pub fn total(&self) -> usize {
        self.total_files + self.total_settings
    }

    pub fn failures(&self) -> usize {
        self.failed_files + self.failed_settings
    }

    pub fn entries_exhausted(&self) -> bool {
        self.processed_files() >= self.total_files
            && self.processed_settings() >= self.total_settings
    }

    pub fn recompute_progress(&mut self) {
        self.progress = progress_percent(self.processed_files() + self.processed_settings(), self.total());
    }

    /// Terminal status for an exhausted task.
    pub fn finish(&mut self) {
        self.status = if self.failures() == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::CompletedWithErrors
        };
    }

    pub fn fail(&mut self, err: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.last_error = err.into();
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} {}% files={}/{} (failed {}) settings={}/{} (failed {})",
            self.id,
            self.status,
            self.progress,
            self.restored_files,
            self.total_files,
            self.failed_files,
            self.restored_settings,
            self.total_settings,
            self.failed_settings
        )
    }
}

/// Floor percentage of processed entries; an empty task is 100% done.
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (processed.min(total) as u128 * 100) / total as u128;
    pct as u8
}

pub fn new_task_id() -> String {
    format!(
        "{}-{:016x}",
        Utc::now().timestamp_millis(),
        rand::random::<u64>()
    )
}

pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Key namespaces under the configured prefix. Everything a task owns is reachable by
/// prefix enumeration.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tasks_prefix(&self) -> String {
        format!("{}task@", self.prefix)
    }

    pub fn task(&self, task_id: &str) -> String {
        format!("{}task@{task_id}", self.prefix)
    }

    pub fn chunks_prefix(&self, task_id: &str) -> String {
        format!("{}chunk@{task_id}@", self.prefix)
    }

    pub fn chunk(&self, task_id: &str, phase: Phase, index: usize) -> String {
        format!("{}{}@{index}", self.chunks_prefix(task_id), phase.as_str())
    }

    pub fn lease(&self, task_id: &str) -> String {
        format!("{}lease@{task_id}", self.prefix)
    }
}
