use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::endpoint::FileMeta;

/// Stable identifier of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a FileEntry inside its job's arena. Never reused within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(pub u32);

/// What to do with a file whose destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Overwrite,
    Resume,
    Skip,
    /// The destination could not be inspected; the entry is not transferred.
    Error,
}

/// Per-entry progress through the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Queued,
    Transferring,
    Done,
    Skipped,
    /// Retries exhausted; waiting for the deferred pass at the end of the job.
    Deferred,
    Failed,
}

/// One queued file or directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: EntryId,
    pub parent: Option<EntryId>,
    pub children: Vec<EntryId>,
    /// Source path.
    pub path: String,
    /// Destination path.
    pub dest_path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<SystemTime>,
    pub is_dir: bool,
    pub action: ConflictAction,
    pub start_offset: u64,
    pub bytes_transferred: u64,
    pub status: FileStatus,
    pub error: Option<String>,
    /// Opaque value the presentation layer uses to find its progress row.
    pub user_tag: Option<u64>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, dest_path: impl Into<String>, size: u64) -> Self {
        Self {
            id: EntryId(0),
            parent: None,
            children: Vec::new(),
            path: path.into(),
            dest_path: dest_path.into(),
            size,
            mode: 0,
            mtime: None,
            is_dir: false,
            action: ConflictAction::Overwrite,
            start_offset: 0,
            bytes_transferred: 0,
            status: FileStatus::Queued,
            error: None,
            user_tag: None,
        }
    }

    pub fn directory(path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        Self {
            is_dir: true,
            ..Self::new(path, dest_path, 0)
        }
    }

    /// Build an entry from a source listing item.
    pub fn from_meta(meta: &FileMeta, dest_path: impl Into<String>) -> Self {
        Self {
            mode: meta.mode,
            mtime: meta.mtime,
            is_dir: meta.is_dir,
            ..Self::new(meta.path.clone(), dest_path, if meta.is_dir { 0 } else { meta.size })
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Bytes that count toward the job total.
    pub fn counted_bytes(&self) -> u64 {
        if self.is_dir || self.action == ConflictAction::Skip {
            0
        } else {
            self.size
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            FileStatus::Done | FileStatus::Skipped | FileStatus::Failed
        )
    }
}

/// Executor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Being expanded and resolved; not yet runnable.
    Pending,
    /// Expanded and resolved, waiting for a worker.
    Ready,
    Connecting,
    CopyingFile,
    FileDone,
    RetryWait,
    AllFilesDone,
    Finished,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

/// Lifecycle flags read by the scheduler and the presentation layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobFlags {
    pub ready: bool,
    pub started: bool,
    pub done: bool,
    pub cancel: bool,
    /// The presentation layer has been told about this job.
    pub show: bool,
}

/// Aggregate sizes of a job's file list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTotals {
    pub total_bytes: u64,
    pub total_files: u64,
    pub total_dirs: u64,
}

impl JobTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a FileEntry>) -> Self {
        let mut totals = Self::default();
        for entry in entries {
            if entry.is_dir {
                totals.total_dirs += 1;
            } else {
                totals.total_files += 1;
            }
            totals.total_bytes += entry.counted_bytes();
        }
        totals
    }
}

/// Movement of a job inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Top,
    Bottom,
}

/// Live progress numbers for the file being copied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FileProgress {
    pub bytes: u64,
    pub size: u64,
    pub rate_bps: f64,
    /// `None` while stalled or before the first chunk.
    pub eta_secs: Option<u64>,
}

/// Reported once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub files_done: u64,
    pub files_skipped: u64,
    /// Files that could not be transferred.
    pub files_failed: u64,
    pub bytes_transferred: u64,
    pub duration_secs: u64,
    pub error: Option<String>,
}

/// Point-in-time view of a job for polling.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub flags: JobFlags,
    pub source: String,
    pub destination: String,
    #[serde(flatten)]
    pub totals: JobTotals,
    /// Bytes skipped by resuming plus bytes moved so far.
    pub bytes_done: u64,
    pub current_file_number: usize,
    pub current_file: Option<String>,
    pub rate_bps: f64,
    pub eta_secs: Option<u64>,
    pub stalled: bool,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub created_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn percentage(&self) -> u8 {
        if self.totals.total_bytes == 0 {
            return if self.flags.done { 100 } else { 0 };
        }
        ((self.bytes_done as f64 / self.totals.total_bytes as f64) * 100.0).min(100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_exclude_skip_and_dirs() {
        let mut skipped = FileEntry::new("/s/b", "/d/b", 40);
        skipped.action = ConflictAction::Skip;
        let entries = vec![
            FileEntry::new("/s/a", "/d/a", 100),
            FileEntry::directory("/s/dir", "/d/dir"),
            skipped,
        ];

        let totals = JobTotals::from_entries(&entries);
        assert_eq!(totals.total_bytes, 100);
        assert_eq!(totals.total_files, 2);
        assert_eq!(totals.total_dirs, 1);
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::RetryWait.is_terminal());
    }
}
