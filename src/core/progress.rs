//! Event sink consumed by the presentation layer.
//!
//! Workers report through a [`ProgressSink`]. Callbacks are made without any
//! job or queue lock held, so a sink may call back into the engine, e.g. to
//! take a snapshot.
//!
//! `conflict_detected` is the only callback with an answer. It replaces the
//! blocking dialog: the worker waits on the returned value while the
//! presentation layer decides. [`ChannelSink`] implements that as an explicit
//! request/response over channels.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::models::{ConflictAction, FileEntry, FileProgress, JobId, JobSnapshot, JobSummary};

/// A file whose destination already exists.
#[derive(Debug, Clone)]
pub struct ConflictQuery {
    pub job_id: JobId,
    pub file: FileEntry,
    pub dest_size: u64,
    pub suggested: ConflictAction,
    /// Resume is only offered when both endpoints support it.
    pub can_resume: bool,
}

/// Answer to a [`ConflictQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictDecision {
    pub action: ConflictAction,
    /// Use `action` for every remaining conflict in the same job.
    pub apply_to_all: bool,
}

impl ConflictDecision {
    pub fn once(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: false,
        }
    }

    pub fn for_all(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: true,
        }
    }
}

/// How a single entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Done,
    Skipped,
    Failed(String),
}

pub trait ProgressSink: Send + Sync {
    fn job_created(&self, _job: &JobSnapshot) {}

    fn file_started(&self, _job: JobId, _file: &FileEntry) {}

    fn file_progress(&self, _job: JobId, _file: &FileEntry, _progress: &FileProgress) {}

    fn file_finished(&self, _job: JobId, _file: &FileEntry, _outcome: &FileOutcome) {}

    fn job_finished(&self, _summary: &JobSummary) {}

    /// Decide a conflict. Without a presentation layer the suggestion wins.
    fn conflict_detected(&self, query: &ConflictQuery) -> ConflictDecision {
        ConflictDecision::once(query.suggested)
    }
}

/// Sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Events forwarded by [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum TransferEvent {
    JobCreated(JobSnapshot),
    FileStarted {
        job: JobId,
        path: String,
    },
    FileProgress {
        job: JobId,
        path: String,
        progress: FileProgress,
    },
    FileFinished {
        job: JobId,
        path: String,
        outcome: FileOutcome,
    },
    JobFinished(JobSummary),
}

/// A conflict waiting for an answer from the presentation layer.
#[derive(Debug)]
pub struct ConflictRequest {
    pub query: ConflictQuery,
    reply: oneshot::Sender<ConflictDecision>,
}

impl ConflictRequest {
    pub fn answer(self, decision: ConflictDecision) {
        // The worker only goes away if the job was torn down meanwhile.
        let _ = self.reply.send(decision);
    }
}

/// Forwards events to async consumers.
///
/// The `conflict_detected` callback blocks the calling worker thread until
/// the matching [`ConflictRequest`] is answered, so it must not be invoked
/// from inside the async runtime.
pub struct ChannelSink {
    events: mpsc::UnboundedSender<TransferEvent>,
    conflicts: mpsc::UnboundedSender<ConflictRequest>,
}

impl ChannelSink {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<TransferEvent>,
        mpsc::UnboundedReceiver<ConflictRequest>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (conflicts, conflicts_rx) = mpsc::unbounded_channel();
        (Self { events, conflicts }, events_rx, conflicts_rx)
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

impl ProgressSink for ChannelSink {
    fn job_created(&self, job: &JobSnapshot) {
        self.emit(TransferEvent::JobCreated(job.clone()));
    }

    fn file_started(&self, job: JobId, file: &FileEntry) {
        self.emit(TransferEvent::FileStarted {
            job,
            path: file.path.clone(),
        });
    }

    fn file_progress(&self, job: JobId, file: &FileEntry, progress: &FileProgress) {
        self.emit(TransferEvent::FileProgress {
            job,
            path: file.path.clone(),
            progress: *progress,
        });
    }

    fn file_finished(&self, job: JobId, file: &FileEntry, outcome: &FileOutcome) {
        self.emit(TransferEvent::FileFinished {
            job,
            path: file.path.clone(),
            outcome: outcome.clone(),
        });
    }

    fn job_finished(&self, summary: &JobSummary) {
        self.emit(TransferEvent::JobFinished(summary.clone()));
    }

    fn conflict_detected(&self, query: &ConflictQuery) -> ConflictDecision {
        let (reply, answer) = oneshot::channel();
        let request = ConflictRequest {
            query: query.clone(),
            reply,
        };
        if self.conflicts.send(request).is_err() {
            warn!(file = %query.file.path, "No one is answering conflicts, using suggestion");
            return ConflictDecision::once(query.suggested);
        }
        match answer.blocking_recv() {
            Ok(decision) => decision,
            Err(_) => {
                warn!(file = %query.file.path, "Conflict request dropped, using suggestion");
                ConflictDecision::once(query.suggested)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(suggested: ConflictAction) -> ConflictQuery {
        ConflictQuery {
            job_id: JobId::new(),
            file: FileEntry::new("/src/a", "/dst/a", 10),
            dest_size: 5,
            suggested,
            can_resume: true,
        }
    }

    #[test]
    fn test_null_sink_accepts_suggestion() {
        let decision = NullSink.conflict_detected(&query(ConflictAction::Resume));
        assert_eq!(decision, ConflictDecision::once(ConflictAction::Resume));
    }

    #[test]
    fn test_channel_sink_round_trip() {
        let (sink, _events, mut conflicts) = ChannelSink::new();

        let responder = std::thread::spawn(move || {
            let request = conflicts.blocking_recv().expect("request");
            assert_eq!(request.query.dest_size, 5);
            request.answer(ConflictDecision::for_all(ConflictAction::Skip));
        });

        let decision = sink.conflict_detected(&query(ConflictAction::Resume));
        responder.join().unwrap();
        assert_eq!(decision, ConflictDecision::for_all(ConflictAction::Skip));
    }

    #[test]
    fn test_channel_sink_falls_back_when_receiver_gone() {
        let (sink, _events, conflicts) = ChannelSink::new();
        drop(conflicts);

        let decision = sink.conflict_detected(&query(ConflictAction::Overwrite));
        assert_eq!(decision.action, ConflictAction::Overwrite);
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, mut events, _conflicts) = ChannelSink::new();
        let job = JobId::new();
        sink.file_started(job, &FileEntry::new("/src/a", "/dst/a", 1));

        match events.try_recv() {
            Ok(TransferEvent::FileStarted { path, .. }) => assert_eq!(path, "/src/a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
