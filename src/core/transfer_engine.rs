//! Per-job worker: connects, walks the file list and drives the copy loop.
//!
//! State machine:
//!
//! ```text
//! Ready -> Connecting -> CopyingFile -> FileDone -> CopyingFile ...
//!                           |                  \-> AllFilesDone -> Finished
//!                           \-> RetryWait -> Connecting   (retryable error)
//! any -> Canceled, any -> Failed
//! ```

pub mod chunked_copy;
pub mod throughput;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::logging::LogThrottle;

use super::endpoint::{Endpoint, EndpointError, EndpointResult};
use super::job::JobHandle;
use super::models::{
    ConflictAction, EntryId, FileEntry, FileProgress, FileStatus, JobState, JobSummary,
};
use super::options::TransferOptions;
use super::orchestrator::Shared;
use super::progress::FileOutcome;

/// How processing one entry ended.
#[derive(Debug)]
enum Step {
    Done,
    Skipped,
    Failed(String),
    /// Retries exhausted; try again after the main pass.
    Deferred(String),
    Canceled,
    /// The job cannot continue, e.g. the host rejected the login.
    Abort(String),
}

#[derive(Debug)]
enum JobEnd {
    Finished,
    Failed(String),
    Canceled,
}

/// Starts a named thread running `body`.
pub(crate) type Spawner = fn(String, Box<dyn FnOnce() + Send>) -> io::Result<()>;

pub(crate) fn os_thread(name: String, body: Box<dyn FnOnce() + Send>) -> io::Result<()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map(|_| ())
}

/// Start a detached worker thread for `job`. If no thread can be started
/// both endpoints are disconnected before the error is returned.
pub(crate) fn spawn(
    job: JobHandle,
    shared: Arc<Shared>,
    source: Box<dyn Endpoint>,
    destination: Box<dyn Endpoint>,
) -> io::Result<()> {
    let name = format!("xferq-{}", job.id());
    let spawner = shared.spawner;
    let slot = Arc::new(Mutex::new(Some(Executor::new(
        job,
        shared,
        source,
        destination,
    ))));

    let worker = Arc::clone(&slot);
    let spawned = spawner(
        name,
        Box::new(move || {
            let executor = worker.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(executor) = executor {
                executor.run();
            }
        }),
    );

    if spawned.is_err() {
        let executor = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut executor) = executor {
            executor.disconnect_both();
        }
    }
    spawned
}

pub(crate) struct Executor {
    job: JobHandle,
    shared: Arc<Shared>,
    pub(crate) source: Box<dyn Endpoint>,
    pub(crate) destination: Box<dyn Endpoint>,
    pub(crate) buffer: Vec<u8>,
    throttle: LogThrottle,
    started_at: Instant,
}

impl Executor {
    fn new(
        job: JobHandle,
        shared: Arc<Shared>,
        mut source: Box<dyn Endpoint>,
        mut destination: Box<dyn Endpoint>,
    ) -> Self {
        let options = &shared.options;
        source.set_timeout(options.network_timeout);
        destination.set_timeout(options.network_timeout);
        let buffer = vec![0u8; options.block_size.max(1)];
        let throttle = LogThrottle::new(options.progress_interval);
        Self {
            job,
            shared,
            source,
            destination,
            buffer,
            throttle,
            started_at: Instant::now(),
        }
    }

    fn run(mut self) {
        let span = info_span!(
            "transfer_job",
            job_id = %self.job.id(),
            source = %self.job.source(),
            destination = %self.job.destination()
        );
        let _guard = span.enter();

        info!("Starting transfer job");
        self.register_aborts();
        let end = self.run_files();
        self.finish(end);
    }

    fn run_files(&mut self) -> JobEnd {
        let mut deferred: Vec<EntryId> = Vec::new();

        loop {
            let next = {
                let mut job = self.job.lock();
                if job.flags.cancel {
                    return JobEnd::Canceled;
                }
                if job.cursor >= job.files.len() {
                    None
                } else {
                    job.file_cancel = self.job.0.cancel.child_token();
                    Some((
                        job.cursor,
                        job.files[job.cursor].clone(),
                        job.file_cancel.clone(),
                    ))
                }
            };
            let Some((index, entry, token)) = next else {
                break;
            };

            let step = self.process(index, &entry, &token);
            if let Step::Deferred(_) = step {
                deferred.push(entry.id);
            }
            if let Some(end) = self.complete_file(index, step) {
                return end;
            }
            self.job.lock().cursor = index + 1;
        }

        for id in deferred {
            let next = {
                let mut job = self.job.lock();
                if job.flags.cancel {
                    return JobEnd::Canceled;
                }
                job.file_cancel = self.job.0.cancel.child_token();
                job.position(id)
                    .map(|index| (index, job.files[index].clone(), job.file_cancel.clone()))
            };
            let Some((index, entry, token)) = next else {
                continue;
            };
            info!(file = %entry.path, "Retrying deferred file");
            let step = match self.process(index, &entry, &token) {
                Step::Deferred(msg) => Step::Failed(msg),
                other => other,
            };
            if let Some(end) = self.complete_file(index, step) {
                return end;
            }
        }

        self.set_state(JobState::AllFilesDone);
        JobEnd::Finished
    }

    /// Drive one entry to an outcome, reconnecting on retryable errors.
    fn process(&mut self, index: usize, entry: &FileEntry, token: &CancellationToken) -> Step {
        match entry.action {
            ConflictAction::Skip => return Step::Skipped,
            ConflictAction::Error => {
                return Step::Failed(
                    entry
                        .error
                        .clone()
                        .unwrap_or_else(|| "destination could not be inspected".to_string()),
                );
            }
            ConflictAction::Overwrite | ConflictAction::Resume => {}
        }

        self.begin_file(index);
        let mut retries_left = self.shared.options.retries;

        loop {
            if token.is_cancelled() {
                return self.interrupted();
            }

            let result = match self.ensure_connected() {
                Ok(()) => {
                    self.set_state(JobState::CopyingFile);
                    if entry.is_dir {
                        self.create_directory(entry)
                    } else {
                        chunked_copy::copy_file(self, index, token)
                    }
                }
                Err(EndpointError::Fatal(msg)) => {
                    error!(error = %msg, "Cannot connect");
                    return Step::Abort(msg);
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Step::Done,
                Err(EndpointError::Canceled) => {
                    self.abort_streams();
                    return self.interrupted();
                }
                Err(EndpointError::Fatal(msg)) => {
                    error!(file = %entry.path, error = %msg, "Transfer failed");
                    self.close_streams();
                    return Step::Failed(msg);
                }
                Err(EndpointError::Retryable(msg)) => {
                    self.disconnect_both();
                    self.prepare_retry(index);
                    if retries_left == 0 {
                        warn!(file = %entry.path, error = %msg, "Retries exhausted, deferring file");
                        return Step::Deferred(msg);
                    }
                    retries_left -= 1;
                    warn!(
                        file = %entry.path,
                        error = %msg,
                        retries_left,
                        "Retryable failure, reconnecting"
                    );
                    self.set_state(JobState::RetryWait);
                    self.job.sleep_unless_canceled(self.shared.options.retry_sleep);
                    self.set_state(JobState::Connecting);
                }
            }
        }
    }

    fn interrupted(&self) -> Step {
        if self.job.0.cancel.is_cancelled() {
            Step::Canceled
        } else {
            info!("Current file skipped");
            Step::Skipped
        }
    }

    fn create_directory(&mut self, entry: &FileEntry) -> EndpointResult<()> {
        self.destination.mkdir(&entry.dest_path)?;
        if self.shared.options.preserve_permissions && entry.mode != 0 {
            if let Err(e) = self.destination.chmod(&entry.dest_path, entry.mode) {
                warn!(path = %entry.dest_path, error = %e, "Failed to set directory permissions");
            }
        }
        Ok(())
    }

    /// Connect whichever side is down, borrowing an idle pooled connection
    /// to the same host when there is one.
    fn ensure_connected(&mut self) -> EndpointResult<()> {
        let reuse = self.shared.options.reuse_connections;
        let mut swapped = false;

        for endpoint in [&mut self.source, &mut self.destination] {
            if endpoint.is_connected() {
                continue;
            }
            if reuse {
                if let Some(mut pooled) = self.shared.pool.checkout(endpoint.id()) {
                    pooled.set_timeout(self.shared.options.network_timeout);
                    *endpoint = pooled;
                    swapped = true;
                    continue;
                }
            }
            set_state(&self.job, JobState::Connecting);
            endpoint.connect()?;
        }

        if swapped {
            self.register_aborts();
        }
        Ok(())
    }

    fn register_aborts(&self) {
        let aborts = vec![self.source.abort_handle(), self.destination.abort_handle()];
        let mut job = self.job.lock();
        if job.flags.cancel {
            for handle in &aborts {
                handle.abort();
            }
        }
        job.aborts = aborts;
    }

    fn disconnect_both(&mut self) {
        self.source.disconnect();
        self.destination.disconnect();
    }

    fn abort_streams(&mut self) {
        self.source.abort_handle().abort();
        self.destination.abort_handle().abort();
        self.close_streams();
    }

    /// Close both streams, ignoring errors from a stream already broken.
    fn close_streams(&mut self) {
        let _ = self.source.end_transfer();
        let _ = self.destination.end_transfer();
    }

    pub(crate) fn options(&self) -> &TransferOptions {
        &self.shared.options
    }

    pub(crate) fn job_entry(&self, index: usize) -> FileEntry {
        self.job.lock().files[index].clone()
    }

    pub(crate) fn can_resume(&self) -> bool {
        self.source.capabilities().resume && self.destination.capabilities().resume
    }

    fn set_state(&self, state: JobState) {
        set_state(&self.job, state);
    }

    fn begin_file(&mut self, index: usize) {
        let entry = {
            let mut job = self.job.lock();
            let first_attempt = job.files[index].status == FileStatus::Queued;
            let entry = &mut job.files[index];
            entry.status = FileStatus::Transferring;
            entry.bytes_transferred = 0;
            let resumed = if first_attempt && entry.action == ConflictAction::Resume {
                entry.start_offset
            } else {
                0
            };
            let entry = entry.clone();
            job.resumed_bytes += resumed;
            job.throughput.reset(Instant::now());
            entry
        };
        self.throttle.reset();
        self.shared.sink.file_started(self.job.id(), &entry);
    }

    /// Account for a broken attempt: keep the written prefix when both sides
    /// can resume, otherwise start the file over.
    fn prepare_retry(&mut self, index: usize) {
        let can_resume = self.can_resume();
        let mut job = self.job.lock();
        let written = job.files[index].bytes_transferred;
        job.transferred_bytes = job.transferred_bytes.saturating_sub(written);
        let entry = &mut job.files[index];
        entry.bytes_transferred = 0;
        if can_resume {
            entry.start_offset += written;
            if written > 0 {
                entry.action = ConflictAction::Resume;
            }
            job.resumed_bytes += written;
        } else {
            let previous = entry.start_offset;
            entry.start_offset = 0;
            entry.action = ConflictAction::Overwrite;
            job.resumed_bytes = job.resumed_bytes.saturating_sub(previous);
        }
    }

    /// Record a chunk and report progress at most once per interval.
    pub(crate) fn record_chunk(&mut self, index: usize, bytes: u64) {
        let now = Instant::now();
        let report = {
            let mut job = self.job.lock();
            job.transferred_bytes += bytes;
            job.throughput.record(now, bytes);
            let entry = &mut job.files[index];
            entry.bytes_transferred += bytes;
            let done = entry.start_offset + entry.bytes_transferred;
            let size = entry.size;
            if self.throttle.should_log() {
                let progress = FileProgress {
                    bytes: done,
                    size,
                    rate_bps: job.throughput.rate(now),
                    eta_secs: job.throughput.eta(now, size.saturating_sub(done)),
                };
                Some((job.files[index].clone(), progress))
            } else {
                None
            }
        };

        if let Some((entry, progress)) = report {
            tracing::debug!(
                file = %entry.path,
                bytes = progress.bytes,
                size = progress.size,
                rate_bps = progress.rate_bps as u64,
                "Transfer progress"
            );
            self.shared
                .sink
                .file_progress(self.job.id(), &entry, &progress);
        }
    }

    /// Store the outcome of an entry. Returns the job end when it stops the job.
    fn complete_file(&mut self, index: usize, step: Step) -> Option<JobEnd> {
        let stop_on_error = self.shared.options.stop_on_error;
        let (status, outcome, end) = match step {
            Step::Done => (FileStatus::Done, Some(FileOutcome::Done), None),
            Step::Skipped => (FileStatus::Skipped, Some(FileOutcome::Skipped), None),
            Step::Deferred(_) => (FileStatus::Deferred, None, None),
            Step::Failed(msg) => {
                let end = stop_on_error.then(|| JobEnd::Failed(msg.clone()));
                (FileStatus::Failed, Some(FileOutcome::Failed(msg)), end)
            }
            Step::Canceled => return Some(JobEnd::Canceled),
            Step::Abort(msg) => return Some(JobEnd::Failed(msg)),
        };

        let entry = {
            let mut job = self.job.lock();
            match status {
                FileStatus::Failed => job.files_failed += 1,
                FileStatus::Skipped => job.files_skipped += 1,
                _ => {}
            }
            if let Some(FileOutcome::Failed(msg)) = &outcome {
                job.files[index].error = Some(msg.clone());
            }
            job.files[index].status = status;
            if end.is_none() {
                job.state = JobState::FileDone;
            }
            job.files[index].clone()
        };

        if let Some(outcome) = outcome {
            self.shared
                .sink
                .file_finished(self.job.id(), &entry, &outcome);
        }
        end
    }

    fn finish(mut self, end: JobEnd) {
        match &end {
            JobEnd::Canceled => {
                info!("Transfer canceled");
                self.abort_streams();
                self.disconnect_both();
            }
            JobEnd::Failed(msg) => {
                error!(error = %msg, "Transfer job failed");
                self.close_streams();
                self.disconnect_both();
            }
            JobEnd::Finished => {
                if self.shared.options.reuse_connections {
                    self.shared.pool.checkin(self.source);
                    self.shared.pool.checkin(self.destination);
                } else {
                    self.disconnect_both();
                }
            }
        }

        // The slot is free before `done` is visible, so a caller woken by
        // `wait` can schedule the next job right away.
        self.shared.release_slot();

        let summary = {
            let mut job = self.job.lock();
            let (state, error) = match end {
                JobEnd::Finished => (JobState::Finished, None),
                JobEnd::Failed(msg) => (JobState::Failed, Some(msg)),
                JobEnd::Canceled => (JobState::Canceled, None),
            };
            if state == JobState::Failed {
                let unfinished = job.files.iter().filter(|e| !e.is_finished()).count() as u64;
                job.files_failed += unfinished;
            }
            job.state = state;
            job.error = error.clone();
            job.flags.done = true;
            job.aborts.clear();
            JobSummary {
                id: self.job.id(),
                state,
                files_done: job
                    .files
                    .iter()
                    .filter(|e| e.status == FileStatus::Done)
                    .count() as u64,
                files_skipped: job.files_skipped,
                files_failed: job.files_failed,
                bytes_transferred: job.transferred_bytes,
                duration_secs: self.started_at.elapsed().as_secs(),
                error,
            }
        };
        self.job.notify();

        info!(
            state = ?summary.state,
            files_done = summary.files_done,
            files_failed = summary.files_failed,
            bytes = summary.bytes_transferred,
            duration_secs = summary.duration_secs,
            "Transfer job complete"
        );
        self.shared.sink.job_finished(&summary);
    }
}

fn set_state(job: &JobHandle, state: JobState) {
    job.lock().state = state;
}
