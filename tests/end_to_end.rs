use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use xferq::adapters::memory::MemoryServer;
use xferq::core::{
    ChannelSink, ConflictAction, ConflictDecision, ConflictPolicy, ConflictQuery, FileEntry,
    JobState, Orchestrator, ProgressSink, TransferEvent, TransferOptions,
};

/// Answers every conflict with a fixed decision and remembers the queries.
struct AnsweringSink {
    decision: ConflictDecision,
    queries: Mutex<Vec<ConflictQuery>>,
}

impl AnsweringSink {
    fn new(decision: ConflictDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            queries: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

impl ProgressSink for AnsweringSink {
    fn conflict_detected(&self, query: &ConflictQuery) -> ConflictDecision {
        self.queries.lock().unwrap().push(query.clone());
        self.decision
    }
}

fn options() -> TransferOptions {
    TransferOptions {
        conflict_policy: ConflictPolicy::Ask,
        block_size: 16,
        retry_sleep: Duration::from_millis(1),
        ..TransferOptions::default()
    }
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

/// Source with a 100-byte file, an empty directory and a 50-byte file; the
/// destination already holds shorter prefixes of both files.
fn fixture() -> (MemoryServer, MemoryServer) {
    let source = MemoryServer::new();
    source.add_file("/s/big", &payload(100, 1));
    source.add_dir("/s/empty");
    source.add_file("/s/small", &payload(50, 2));

    let destination = MemoryServer::new();
    destination.add_file("/d/big", &payload(100, 1)[..40]);
    destination.add_file("/d/small", &payload(50, 2)[..10]);
    (source, destination)
}

fn selection() -> Vec<FileEntry> {
    vec![
        FileEntry::new("/s/big", "/d/big", 100),
        FileEntry::directory("/s/empty", "/d/empty"),
        FileEntry::new("/s/small", "/d/small", 50),
    ]
}

#[test]
fn test_three_entries_two_conflicts() {
    let (source, destination) = fixture();
    let sink = AnsweringSink::new(ConflictDecision::once(ConflictAction::Resume));
    let engine = Orchestrator::new(options(), sink.clone());

    let job = engine
        .enqueue(
            selection(),
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();

    assert_eq!(sink.prompts(), 2);
    let totals = job.totals();
    assert_eq!(totals.total_bytes, 150);
    assert_eq!(totals.total_files, 2);
    assert_eq!(totals.total_dirs, 1);

    assert_eq!(engine.start(&job), Ok(true));
    assert!(job.wait(Duration::from_secs(10)));

    let snapshot = job.snapshot();
    assert_eq!(snapshot.state, JobState::Finished);
    assert_eq!(snapshot.current_file_number, 3);
    assert_eq!(snapshot.bytes_done, 150);
    assert_eq!(snapshot.percentage(), 100);
    assert_eq!(destination.read_file("/d/big").unwrap(), payload(100, 1));
    assert_eq!(destination.read_file("/d/small").unwrap(), payload(50, 2));
    assert!(destination.meta("/d/empty").unwrap().is_dir);
    // Only the missing tails crossed the wire.
    assert_eq!(destination.bytes_written(), 60 + 40);
}

#[test]
fn test_skip_excluded_from_totals() {
    let (source, destination) = fixture();
    let sink = AnsweringSink::new(ConflictDecision::once(ConflictAction::Skip));
    let engine = Orchestrator::new(options(), sink.clone());

    let job = engine
        .enqueue(
            selection(),
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();

    assert_eq!(sink.prompts(), 2);
    assert_eq!(job.totals().total_bytes, 0);

    engine.start(&job).unwrap();
    assert!(job.wait(Duration::from_secs(10)));
    let snapshot = job.snapshot();
    assert_eq!(snapshot.state, JobState::Finished);
    assert_eq!(snapshot.files_skipped, 2);
    assert_eq!(destination.read_file("/d/big").unwrap().len(), 40);
}

#[test]
fn test_apply_to_all_asks_once() {
    let (source, destination) = fixture();
    let sink = AnsweringSink::new(ConflictDecision::for_all(ConflictAction::Overwrite));
    let engine = Orchestrator::new(options(), sink.clone());

    let job = engine
        .enqueue(
            selection(),
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();

    assert_eq!(sink.prompts(), 1);
    assert!(
        job.files()
            .iter()
            .filter(|e| !e.is_dir)
            .all(|e| e.action == ConflictAction::Overwrite && e.start_offset == 0)
    );
}

#[tokio::test]
async fn test_channel_sink_round_trip() {
    let (source, destination) = fixture();
    let (sink, mut events, mut conflicts) = ChannelSink::new();
    let engine = Orchestrator::new(options(), Arc::new(sink));

    let answering = tokio::spawn(async move {
        let mut asked = 0;
        while let Some(request) = conflicts.recv().await {
            asked += 1;
            let action = if request.query.can_resume {
                ConflictAction::Resume
            } else {
                ConflictAction::Overwrite
            };
            request.answer(ConflictDecision::once(action));
        }
        asked
    });

    let enqueue_engine = engine.clone();
    let job = tokio::task::spawn_blocking(move || {
        enqueue_engine.enqueue(
            selection(),
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
    })
    .await
    .unwrap()
    .unwrap();

    engine.start(&job).unwrap();

    let summary = timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(TransferEvent::JobFinished(summary)) => break summary,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timeout waiting for job to finish");

    assert_eq!(summary.state, JobState::Finished);
    assert_eq!(summary.files_failed, 0);
    assert_eq!(summary.files_done, 3);

    drop(engine);
    drop(job);
    answering.abort();
}
