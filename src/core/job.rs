//! A transfer job and the handle the presentation layer holds on to.
//!
//! All mutable job state lives in [`TransferJob`] behind the job's own mutex.
//! The lock is only held for bookkeeping, never across an Endpoint call.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::endpoint::{AbortHandle, Endpoint, EndpointId};
use super::models::{
    EntryId, FileEntry, FileStatus, JobFlags, JobId, JobSnapshot, JobState, JobTotals,
};
use super::transfer_engine::throughput::Throughput;

/// Mutable state of one job.
pub struct TransferJob {
    pub(crate) files: Vec<FileEntry>,
    pub(crate) cursor: usize,
    pub(crate) totals: JobTotals,
    pub(crate) state: JobState,
    pub(crate) flags: JobFlags,
    /// Endpoints parked here until a worker takes them.
    pub(crate) endpoints: Option<(Box<dyn Endpoint>, Box<dyn Endpoint>)>,
    /// Abort handles of the endpoints a worker is using, for `cancel`.
    pub(crate) aborts: Vec<AbortHandle>,
    /// Cancels only the file in flight; replaced for every file.
    pub(crate) file_cancel: CancellationToken,
    /// Offsets skipped by resuming.
    pub(crate) resumed_bytes: u64,
    /// Bytes moved by the worker.
    pub(crate) transferred_bytes: u64,
    pub(crate) throughput: Throughput,
    pub(crate) files_failed: u64,
    pub(crate) files_skipped: u64,
    pub(crate) error: Option<String>,
    next_entry: u32,
}

impl TransferJob {
    pub(crate) fn current(&self) -> Option<&FileEntry> {
        self.files.get(self.cursor)
    }

    pub(crate) fn position(&self, id: EntryId) -> Option<usize> {
        self.files.iter().position(|e| e.id == id)
    }

    pub(crate) fn recompute_totals(&mut self) {
        self.totals = JobTotals::from_entries(&self.files);
    }

    /// Append an expanded batch, renumbering its ids into this job's arena.
    pub(crate) fn append_entries(&mut self, batch: Vec<FileEntry>) {
        let base = self.next_entry;
        let rebase = |id: EntryId| EntryId(id.0 + base);
        for mut entry in batch {
            entry.id = rebase(entry.id);
            entry.parent = entry.parent.map(rebase);
            entry.children = entry.children.iter().copied().map(rebase).collect();
            self.next_entry = self.next_entry.max(entry.id.0 + 1);
            self.files.push(entry);
        }
        self.recompute_totals();
    }

    /// Drop an entry and everything below it.
    pub(crate) fn remove_subtree(&mut self, id: EntryId) -> usize {
        let mut doomed = vec![id];
        let mut i = 0;
        while i < doomed.len() {
            if let Some(pos) = self.position(doomed[i]) {
                doomed.extend(self.files[pos].children.iter().copied());
            }
            i += 1;
        }

        if let Some(parent) = self
            .position(id)
            .and_then(|pos| self.files[pos].parent)
            .and_then(|parent| self.position(parent))
        {
            self.files[parent].children.retain(|child| *child != id);
        }

        let before = self.files.len();
        self.files.retain(|e| !doomed.contains(&e.id));
        self.recompute_totals();
        before - self.files.len()
    }
}

pub(crate) struct JobShared {
    pub(crate) id: JobId,
    pub(crate) source: EndpointId,
    pub(crate) destination: EndpointId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
    job: Mutex<TransferJob>,
    changed: Condvar,
}

/// Cheap, cloneable reference to a queued job.
#[derive(Clone)]
pub struct JobHandle(pub(crate) Arc<JobShared>);

impl JobHandle {
    /// A new, empty Pending job between two endpoint identities.
    pub(crate) fn new(source: EndpointId, destination: EndpointId) -> Self {
        let cancel = CancellationToken::new();
        let job = TransferJob {
            files: Vec::new(),
            cursor: 0,
            totals: JobTotals::default(),
            state: JobState::Pending,
            flags: JobFlags::default(),
            endpoints: None,
            aborts: Vec::new(),
            file_cancel: cancel.child_token(),
            resumed_bytes: 0,
            transferred_bytes: 0,
            throughput: Throughput::new(),
            files_failed: 0,
            files_skipped: 0,
            error: None,
            next_entry: 0,
        };
        Self(Arc::new(JobShared {
            id: JobId::new(),
            source,
            destination,
            created_at: Utc::now(),
            cancel,
            job: Mutex::new(job),
            changed: Condvar::new(),
        }))
    }

    pub fn id(&self) -> JobId {
        self.0.id
    }

    pub fn source(&self) -> &EndpointId {
        &self.0.source
    }

    pub fn destination(&self) -> &EndpointId {
        &self.0.destination
    }

    /// Lock the job. A poisoned lock is recovered; the state is plain data.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TransferJob> {
        self.0.job.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake anyone blocked in [`wait`](Self::wait) or a retry backoff.
    pub(crate) fn notify(&self) {
        self.0.changed.notify_all();
    }

    /// Sleep up to `timeout`, returning early once the job or the current
    /// file is canceled. The job lock is released while sleeping.
    pub(crate) fn sleep_unless_canceled(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .0
            .changed
            .wait_timeout_while(guard, timeout, |job| {
                !job.flags.cancel && !job.file_cancel.is_cancelled()
            })
            .map_err(|e| e.into_inner());
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn flags(&self) -> JobFlags {
        self.lock().flags
    }

    pub fn is_done(&self) -> bool {
        self.lock().flags.done
    }

    /// Copy of the entry list, in transfer order.
    pub fn files(&self) -> Vec<FileEntry> {
        self.lock().files.clone()
    }

    pub fn totals(&self) -> JobTotals {
        self.lock().totals
    }

    /// Files that could not be transferred so far.
    pub fn failed_count(&self) -> u64 {
        self.lock().files_failed
    }

    /// Block until the job is done or `timeout` passes. Returns `done`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        match self
            .0
            .changed
            .wait_timeout_while(guard, timeout, |job| !job.flags.done)
        {
            Ok((job, _)) => job.flags.done,
            Err(poisoned) => poisoned.into_inner().0.flags.done,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let now = Instant::now();
        let job = self.lock();
        let current = job.current();
        let remaining = current
            .map(|e| {
                e.size
                    .saturating_sub(e.start_offset)
                    .saturating_sub(e.bytes_transferred)
            })
            .unwrap_or(0);
        let copying = job.state == JobState::CopyingFile;

        JobSnapshot {
            id: self.0.id,
            state: job.state,
            flags: job.flags,
            source: self.0.source.to_string(),
            destination: self.0.destination.to_string(),
            totals: job.totals,
            bytes_done: job.resumed_bytes + job.transferred_bytes,
            current_file_number: job.cursor,
            current_file: current
                .filter(|e| e.status == FileStatus::Transferring)
                .map(|e| e.path.clone()),
            rate_bps: if copying { job.throughput.rate(now) } else { 0.0 },
            eta_secs: if copying {
                job.throughput.eta(now, remaining)
            } else {
                None
            },
            stalled: copying && job.throughput.is_stalled(now),
            files_failed: job.files_failed,
            files_skipped: job.files_skipped,
            created_at: self.0.created_at,
        }
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.0.id)
            .field("source", &self.0.source)
            .field("destination", &self.0.destination)
            .finish()
    }
}
