//! Public face of the engine: builds jobs, owns the queue and starts workers.
//!
//! Lock order is active-slot counter, then a job. The queue lock is never
//! held together with either.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use super::endpoint::{Endpoint, EndpointError, EndpointId};
use super::expander;
use super::job::JobHandle;
use super::models::{Direction, EntryId, FileEntry, FileStatus, JobState, JobSummary};
use super::options::TransferOptions;
use super::pool::ConnectionPool;
use super::progress::ProgressSink;
use super::queue::{QueueError, TransferQueue};
use super::resolver::{self, ResolverSettings};
use super::transfer_engine::{self, Spawner};

/// Why an enqueue was abandoned. No job is created in any of these cases.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("nothing selected to transfer")]
    Empty,
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: EndpointId,
        source: EndpointError,
    },
    #[error("cannot expand selection: {0}")]
    Expand(#[source] EndpointError),
    #[error("cannot inspect destination: {0}")]
    Resolve(#[source] EndpointError),
}

/// State shared between the orchestrator and its workers.
pub(crate) struct Shared {
    pub(crate) options: TransferOptions,
    pub(crate) queue: TransferQueue,
    pub(crate) pool: ConnectionPool,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) spawner: Spawner,
    active: Mutex<usize>,
}

impl Shared {
    pub(crate) fn release_slot(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *active = active.saturating_sub(1);
    }

    fn active_count(&self) -> usize {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand an endpoint back: to the pool when reuse is on, else hang up.
    fn release(&self, mut endpoint: Box<dyn Endpoint>) {
        if self.options.reuse_connections {
            self.pool.checkin(endpoint);
        } else {
            endpoint.disconnect();
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(options: TransferOptions, sink: Arc<dyn ProgressSink>) -> Self {
        Self::with_spawner(options, sink, transfer_engine::os_thread)
    }

    pub(crate) fn with_spawner(
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
        spawner: Spawner,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                queue: TransferQueue::new(),
                pool: ConnectionPool::new(),
                sink,
                spawner,
                active: Mutex::new(0),
            }),
        }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.shared.options
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.shared.queue
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// Jobs in queue order.
    pub fn jobs(&self) -> Vec<JobHandle> {
        self.shared.queue.snapshot()
    }

    /// Jobs with a running worker.
    pub fn active_jobs(&self) -> usize {
        self.shared.active_count()
    }

    /// Expand `files` through `source`, resolve conflicts against
    /// `destination` and queue the result as a Ready job.
    ///
    /// Blocks on network I/O and, with the `ask` policy, on the sink's
    /// conflict answers. When merging is on and a Ready job for the same pair
    /// has not started yet, the batch is appended to that job instead.
    pub fn enqueue(
        &self,
        files: Vec<FileEntry>,
        source: Box<dyn Endpoint>,
        destination: Box<dyn Endpoint>,
    ) -> Result<JobHandle, EnqueueError> {
        if files.is_empty() {
            return Err(EnqueueError::Empty);
        }
        let shared = &self.shared;

        let mut source = self.attach(source);
        connect(source.as_mut())?;

        let expansion = match expander::expand(source.as_mut(), files) {
            Ok(expansion) => expansion,
            Err(e) => {
                error!(source = %source.id(), error = %e, "Expansion failed, job abandoned");
                shared.release(source);
                return Err(EnqueueError::Expand(e));
            }
        };

        let mut destination = self.attach(destination);
        if let Err(e) = connect(destination.as_mut()) {
            shared.release(source);
            return Err(e);
        }

        let job = JobHandle::new(source.id().clone(), destination.id().clone());
        let can_resume = source.capabilities().resume && destination.capabilities().resume;
        let mut entries = expansion.entries;
        let resolution = resolver::resolve(
            job.id(),
            &mut entries,
            destination.as_mut(),
            can_resume,
            &ResolverSettings::from(&shared.options),
            shared.sink.as_ref(),
        );
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(destination = %destination.id(), error = %e, "Conflict resolution failed, job abandoned");
                shared.release(source);
                shared.release(destination);
                return Err(EnqueueError::Resolve(e));
            }
        };

        let entries = if shared.options.append_transfers {
            match shared
                .queue
                .try_merge(source.id(), destination.id(), entries)
            {
                Ok(existing) => {
                    shared.release(source);
                    shared.release(destination);
                    return Ok(existing);
                }
                Err(entries) => entries,
            }
        } else {
            entries
        };

        {
            let mut state = job.lock();
            state.append_entries(entries);
            state.endpoints = Some((source, destination));
            state.state = JobState::Ready;
            state.flags.ready = true;
            state.flags.show = true;
        }
        shared.queue.push(job.clone());

        let snapshot = job.snapshot();
        info!(
            job_id = %job.id(),
            source = %job.source(),
            destination = %job.destination(),
            total_files = snapshot.totals.total_files,
            total_bytes = snapshot.totals.total_bytes,
            conflicts = resolution.conflicts,
            "Job queued"
        );
        shared.sink.job_created(&snapshot);
        Ok(job)
    }

    /// Prefer an idle pooled connection to the same identity.
    fn attach(&self, endpoint: Box<dyn Endpoint>) -> Box<dyn Endpoint> {
        let mut endpoint = if self.shared.options.reuse_connections && !endpoint.is_connected() {
            self.shared.pool.checkout(endpoint.id()).unwrap_or(endpoint)
        } else {
            endpoint
        };
        endpoint.set_timeout(self.shared.options.network_timeout);
        endpoint
    }

    /// Start a worker for `job`.
    ///
    /// Returns `Ok(false)` when the active-job limit is reached; the job stays
    /// Ready and can be started later.
    pub fn start(&self, job: &JobHandle) -> Result<bool, QueueError> {
        let id = job.id();
        if self.shared.queue.get(id).is_none() {
            return Err(QueueError::UnknownJob(id));
        }

        let endpoints = {
            let mut active = self.shared.active.lock().unwrap_or_else(|e| e.into_inner());
            let mut state = job.lock();
            if state.flags.started {
                return Err(QueueError::AlreadyStarted(id));
            }
            if !state.flags.ready || state.flags.cancel || state.flags.done {
                return Err(QueueError::NotReady(id));
            }
            if *active >= self.shared.options.max_active_jobs.max(1) {
                return Ok(false);
            }
            let Some(endpoints) = state.endpoints.take() else {
                return Err(QueueError::NotReady(id));
            };
            *active += 1;
            state.flags.started = true;
            state.state = JobState::Connecting;
            endpoints
        };

        let (source, destination) = endpoints;
        if let Err(e) = transfer_engine::spawn(job.clone(), self.shared.clone(), source, destination)
        {
            error!(job_id = %id, error = %e, "Cannot spawn worker thread");
            self.shared.release_slot();
            self.finish_without_worker(job, JobState::Failed, Some(e.to_string()));
            return Err(QueueError::WorkerUnavailable(id));
        }
        Ok(true)
    }

    /// Start Ready jobs in queue order while the limit allows. Returns how
    /// many were started.
    pub fn schedule(&self) -> usize {
        self.shared
            .pool
            .reap_idle(self.shared.options.pool_idle_timeout);

        let mut started = 0;
        for job in self.shared.queue.snapshot() {
            let flags = job.flags();
            if !flags.ready || flags.started || flags.cancel || flags.done {
                continue;
            }
            match self.start(&job) {
                Ok(true) => started += 1,
                Ok(false) => break,
                Err(e) => warn!(job_id = %job.id(), error = %e, "Cannot start job"),
            }
        }
        started
    }

    /// Cancel a job. A running worker stops at its next chunk boundary; a job
    /// that never started is Canceled immediately.
    pub fn cancel(&self, job: &JobHandle) -> Result<(), QueueError> {
        let id = job.id();
        if self.shared.queue.get(id).is_none() {
            return Err(QueueError::UnknownJob(id));
        }

        let unstarted = {
            let mut state = job.lock();
            if state.flags.done {
                return Ok(());
            }
            state.flags.cancel = true;
            job.0.cancel.cancel();
            for handle in &state.aborts {
                handle.abort();
            }
            !state.flags.started
        };
        info!(job_id = %id, "Cancel requested");

        if unstarted {
            self.finish_without_worker(job, JobState::Canceled, None);
        } else {
            job.notify();
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for job in self.shared.queue.snapshot() {
            let _ = self.cancel(&job);
        }
    }

    /// Abandon the file in flight and continue with the next one.
    ///
    /// Between two files there is nothing to skip and `NoFileInFlight` is
    /// returned; the next file is not affected.
    pub fn skip_current_file(&self, job: &JobHandle) -> Result<(), QueueError> {
        let id = job.id();
        if self.shared.queue.get(id).is_none() {
            return Err(QueueError::UnknownJob(id));
        }
        let state = job.lock();
        if !state.flags.started || state.flags.done {
            return Err(QueueError::NotReady(id));
        }
        // The deferred pass runs behind the cursor, so look the entry up by status.
        let Some(entry) = state
            .files
            .iter()
            .find(|e| e.status == FileStatus::Transferring)
        else {
            return Err(QueueError::NoFileInFlight(id));
        };
        info!(job_id = %id, file = %entry.path, "Skipping current file");
        state.file_cancel.cancel();
        for handle in &state.aborts {
            handle.abort();
        }
        drop(state);
        job.notify();
        Ok(())
    }

    pub fn reorder(&self, job: &JobHandle, direction: Direction) -> Result<(), QueueError> {
        self.shared.queue.reorder(job.id(), direction)
    }

    /// Drop an entry and its subtree from a job that has not started.
    /// Returns how many entries were removed.
    pub fn remove_file(&self, job: &JobHandle, entry: EntryId) -> Result<usize, QueueError> {
        let id = job.id();
        let mut state = job.lock();
        if state.flags.started || state.flags.done {
            return Err(QueueError::AlreadyStarted(id));
        }
        if state.position(entry).is_none() {
            return Err(QueueError::UnknownEntry(id));
        }
        Ok(state.remove_subtree(entry))
    }

    /// Remove a finished job from the queue.
    pub fn remove(&self, job: &JobHandle) -> Result<(), QueueError> {
        self.shared.queue.remove(job.id()).map(|_| ())
    }

    /// Remove every finished job, returning them.
    pub fn acknowledge_finished(&self) -> Vec<JobHandle> {
        self.shared
            .queue
            .snapshot()
            .into_iter()
            .filter(|job| job.is_done())
            .filter_map(|job| self.shared.queue.remove(job.id()).ok())
            .collect()
    }

    /// Cancel everything and hang up idle connections.
    pub fn shutdown(&self) {
        self.cancel_all();
        self.shared.pool.disconnect_all();
    }

    /// Mark a job that has no worker as done and report it.
    fn finish_without_worker(&self, job: &JobHandle, end: JobState, error: Option<String>) {
        let (endpoints, summary) = {
            let mut state = job.lock();
            let unfinished = state.files.iter().filter(|e| !e.is_finished()).count() as u64;
            if end == JobState::Failed {
                state.files_failed += unfinished;
            }
            state.state = end;
            state.error = error.clone();
            state.flags.done = true;
            let summary = JobSummary {
                id: job.id(),
                state: end,
                files_done: state
                    .files
                    .iter()
                    .filter(|e| e.status == FileStatus::Done)
                    .count() as u64,
                files_skipped: state.files_skipped,
                files_failed: state.files_failed,
                bytes_transferred: state.transferred_bytes,
                duration_secs: 0,
                error,
            };
            (state.endpoints.take(), summary)
        };
        if let Some((mut source, mut destination)) = endpoints {
            source.disconnect();
            destination.disconnect();
        }
        job.notify();
        self.shared.sink.job_finished(&summary);
    }
}

fn connect(endpoint: &mut dyn Endpoint) -> Result<(), EnqueueError> {
    if endpoint.is_connected() {
        return Ok(());
    }
    endpoint.connect().map_err(|source| {
        error!(endpoint = %endpoint.id(), error = %source, "Connect failed");
        EnqueueError::Connect {
            endpoint: endpoint.id().clone(),
            source,
        }
    })
}
