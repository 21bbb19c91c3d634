//! Ordered collection of jobs and the merge policy for new batches.
//!
//! The queue mutex guards only the list of handles. It is never held while a
//! job lock is taken or while any Endpoint call is in progress.

use std::sync::{Mutex, MutexGuard};

use tracing::info;

use super::endpoint::EndpointId;
use super::job::JobHandle;
use super::models::{Direction, FileEntry, JobId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} is not in the queue")]
    UnknownJob(JobId),
    #[error("job {0} is still running")]
    NotDone(JobId),
    #[error("job {0} is not ready to start")]
    NotReady(JobId),
    #[error("job {0} has already started")]
    AlreadyStarted(JobId),
    #[error("entry not found in job {0}")]
    UnknownEntry(JobId),
    #[error("job {0} has no file in flight")]
    NoFileInFlight(JobId),
    #[error("no worker thread could be started for job {0}")]
    WorkerUnavailable(JobId),
}

#[derive(Default)]
pub struct TransferQueue {
    jobs: Mutex<Vec<JobHandle>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self) -> MutexGuard<'_, Vec<JobHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the handle list; safe to iterate while workers run.
    pub fn snapshot(&self) -> Vec<JobHandle> {
        self.list().clone()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list().is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<JobHandle> {
        self.list().iter().find(|job| job.id() == id).cloned()
    }

    pub(crate) fn push(&self, job: JobHandle) {
        self.list().push(job);
    }

    /// Concatenate `entries` onto a Ready, not yet started job for the same
    /// endpoint pair. Gives the entries back when no such job exists.
    pub(crate) fn try_merge(
        &self,
        source: &EndpointId,
        destination: &EndpointId,
        entries: Vec<FileEntry>,
    ) -> Result<JobHandle, Vec<FileEntry>> {
        for job in self.snapshot() {
            if job.source() != source || job.destination() != destination {
                continue;
            }
            let mut state = job.lock();
            if !state.flags.ready || state.flags.started || state.flags.cancel {
                continue;
            }
            let existing = state.files.len();
            let added = entries.len();
            state.append_entries(entries);
            drop(state);
            info!(
                job_id = %job.id(),
                existing_entries = existing,
                added_entries = added,
                "Merged new batch into queued job"
            );
            return Ok(job);
        }
        Err(entries)
    }

    /// Remove a finished job.
    pub fn remove(&self, id: JobId) -> Result<JobHandle, QueueError> {
        let job = self.get(id).ok_or(QueueError::UnknownJob(id))?;
        if !job.is_done() {
            return Err(QueueError::NotDone(id));
        }
        let mut jobs = self.list();
        jobs.retain(|j| j.id() != id);
        Ok(job)
    }

    /// Move a job within the queue. Moving past either end is a no-op.
    pub fn reorder(&self, id: JobId, direction: Direction) -> Result<(), QueueError> {
        let mut jobs = self.list();
        let from = jobs
            .iter()
            .position(|j| j.id() == id)
            .ok_or(QueueError::UnknownJob(id))?;
        let last = jobs.len() - 1;
        let to = match direction {
            Direction::Up => from.saturating_sub(1),
            Direction::Down => (from + 1).min(last),
            Direction::Top => 0,
            Direction::Bottom => last,
        };
        let job = jobs.remove(from);
        jobs.insert(to, job);
        Ok(())
    }
}
