use std::sync::Arc;
use std::time::{Duration, Instant};

use xferq::adapters::memory::{Fault, MemoryServer};
use xferq::core::{
    Capabilities, ConflictPolicy, EndpointError, FileEntry, FileStatus, JobHandle, JobState,
    NullSink, Orchestrator, TransferOptions,
};

fn options() -> TransferOptions {
    TransferOptions {
        conflict_policy: ConflictPolicy::Overwrite,
        block_size: 16,
        retry_sleep: Duration::from_millis(1),
        progress_interval: Duration::ZERO,
        ..TransferOptions::default()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn servers() -> (MemoryServer, MemoryServer) {
    let source = MemoryServer::new();
    source.add_file("/s/a", &payload(100));
    source.add_file("/s/b", &payload(30));
    (source, MemoryServer::new())
}

fn two_files() -> Vec<FileEntry> {
    vec![
        FileEntry::new("/s/a", "/d/a", 100),
        FileEntry::new("/s/b", "/d/b", 30),
    ]
}

fn run(
    options: TransferOptions,
    files: Vec<FileEntry>,
    source: &MemoryServer,
    destination: &MemoryServer,
) -> JobHandle {
    let engine = Orchestrator::new(options, Arc::new(NullSink));
    let job = engine
        .enqueue(
            files,
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();
    assert_eq!(engine.start(&job), Ok(true));
    assert!(job.wait(Duration::from_secs(10)), "job did not finish");
    job
}

fn status_of(job: &JobHandle, path: &str) -> FileStatus {
    job.files()
        .into_iter()
        .find(|e| e.path == path)
        .map(|e| e.status)
        .unwrap()
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_retryable_read_reconnects_and_completes() {
    let (source, destination) = servers();
    source.inject(Fault::Read(EndpointError::retryable("connection reset")));

    let job = run(options(), two_files(), &source, &destination);

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(job.failed_count(), 0);
    assert_eq!(source.connects(), 2);
    assert_eq!(destination.connects(), 2);
    assert_eq!(destination.read_file("/d/a").unwrap(), payload(100));
}

#[test]
fn test_resumes_after_mid_file_failure() {
    let (source, destination) = servers();
    // Three 16-byte chunks land before the connection drops.
    source.inject_after(3, Fault::Read(EndpointError::retryable("connection reset")));

    let job = run(options(), two_files(), &source, &destination);

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(destination.read_file("/d/a").unwrap(), payload(100));
    assert_eq!(destination.bytes_written(), 100 + 30);
    assert_eq!(job.snapshot().bytes_done, 130);
}

#[test]
fn test_restarts_file_without_resume_support() {
    let (source, destination) = servers();
    destination.set_capabilities(Capabilities {
        resume: false,
        ..Capabilities::default()
    });
    source.inject_after(3, Fault::Read(EndpointError::retryable("connection reset")));

    let job = run(options(), two_files(), &source, &destination);

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(destination.read_file("/d/a").unwrap(), payload(100));
    assert_eq!(destination.bytes_written(), 48 + 100 + 30);
    assert_eq!(job.snapshot().bytes_done, 130);
}

#[test]
fn test_fatal_error_fails_only_that_file() {
    let (source, destination) = servers();
    source.inject(Fault::Read(EndpointError::fatal("permission denied")));

    let job = run(options(), two_files(), &source, &destination);

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(job.failed_count(), 1);
    assert_eq!(status_of(&job, "/s/a"), FileStatus::Failed);
    assert_eq!(status_of(&job, "/s/b"), FileStatus::Done);
    let failed = job.files().into_iter().find(|e| e.path == "/s/a").unwrap();
    assert_eq!(failed.error.as_deref(), Some("permission denied"));
    assert_eq!(source.connects(), 1);
}

#[test]
fn test_stop_on_error_ends_job() {
    let (source, destination) = servers();
    source.inject(Fault::Read(EndpointError::fatal("permission denied")));

    let job = run(
        TransferOptions {
            stop_on_error: true,
            ..options()
        },
        two_files(),
        &source,
        &destination,
    );

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failed_count(), 2);
    assert!(destination.read_file("/d/b").is_none());
}

#[test]
fn test_deferred_file_retried_after_the_rest() {
    let (source, destination) = servers();
    // retries = 1: two failures use up the first pass.
    for _ in 0..2 {
        source.inject(Fault::Read(EndpointError::retryable("busy")));
    }

    let job = run(
        TransferOptions {
            retries: 1,
            ..options()
        },
        two_files(),
        &source,
        &destination,
    );

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(job.failed_count(), 0);
    assert_eq!(status_of(&job, "/s/a"), FileStatus::Done);
    assert_eq!(destination.read_file("/d/a").unwrap(), payload(100));
    assert_eq!(destination.read_file("/d/b").unwrap(), payload(30));
}

#[test]
fn test_deferred_file_fails_when_second_pass_fails() {
    let (source, destination) = servers();
    for _ in 0..4 {
        source.inject(Fault::Read(EndpointError::retryable("busy")));
    }

    let job = run(
        TransferOptions {
            retries: 1,
            ..options()
        },
        two_files(),
        &source,
        &destination,
    );

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(job.failed_count(), 1);
    assert_eq!(status_of(&job, "/s/a"), FileStatus::Failed);
    assert_eq!(status_of(&job, "/s/b"), FileStatus::Done);
}

#[test]
fn test_transfer_timeout_is_retried_then_reported() {
    let (source, destination) = servers();
    source.set_read_delay(Duration::from_millis(50));

    let job = run(
        TransferOptions {
            retries: 0,
            network_timeout: Duration::from_millis(10),
            ..options()
        },
        vec![FileEntry::new("/s/b", "/d/b", 30)],
        &source,
        &destination,
    );

    assert_eq!(job.failed_count(), 1);
    let entry = &job.files()[0];
    assert_eq!(entry.status, FileStatus::Failed);
    assert!(entry.error.as_deref().unwrap().contains("timed out"));
}

#[test]
fn test_cancel_mid_copy_stops_writes() {
    let source = MemoryServer::new();
    source.add_file("/s/huge", &payload(64 * 1024));
    source.set_read_delay(Duration::from_millis(5));
    let destination = MemoryServer::new();

    let engine = Orchestrator::new(
        TransferOptions {
            block_size: 512,
            ..options()
        },
        Arc::new(NullSink),
    );
    let job = engine
        .enqueue(
            vec![FileEntry::new("/s/huge", "/d/huge", 64 * 1024)],
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();
    engine.start(&job).unwrap();

    wait_until(Duration::from_secs(5), || destination.bytes_written() > 0);
    engine.cancel(&job).unwrap();
    assert!(job.wait(Duration::from_secs(5)));

    assert_eq!(job.state(), JobState::Canceled);
    let written = destination.bytes_written();
    assert!(written < 64 * 1024);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(destination.bytes_written(), written);
    assert_eq!(engine.active_jobs(), 0);
}

#[test]
fn test_skip_current_file_moves_on() {
    let source = MemoryServer::new();
    source.add_file("/s/huge", &payload(64 * 1024));
    source.add_file("/s/tiny", &payload(20));
    source.set_read_delay(Duration::from_millis(5));
    let destination = MemoryServer::new();

    let engine = Orchestrator::new(
        TransferOptions {
            block_size: 512,
            ..options()
        },
        Arc::new(NullSink),
    );
    let job = engine
        .enqueue(
            vec![
                FileEntry::new("/s/huge", "/d/huge", 64 * 1024),
                FileEntry::new("/s/tiny", "/d/tiny", 20),
            ],
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();
    engine.start(&job).unwrap();

    wait_until(Duration::from_secs(5), || destination.bytes_written() > 0);
    engine.skip_current_file(&job).unwrap();
    assert!(job.wait(Duration::from_secs(10)));

    assert_eq!(job.state(), JobState::Finished);
    assert_eq!(status_of(&job, "/s/huge"), FileStatus::Skipped);
    assert_eq!(status_of(&job, "/s/tiny"), FileStatus::Done);
    assert_eq!(destination.read_file("/d/tiny").unwrap(), payload(20));
    assert_eq!(job.snapshot().files_skipped, 1);
}

#[test]
fn test_fatal_reconnect_fails_job() {
    let (source, destination) = servers();
    let engine = Orchestrator::new(options(), Arc::new(NullSink));
    let job = engine
        .enqueue(
            two_files(),
            Box::new(source.endpoint("src")),
            Box::new(destination.endpoint("dst")),
        )
        .unwrap();
    source.inject(Fault::Read(EndpointError::retryable("connection reset")));
    source.inject(Fault::Connect(EndpointError::fatal("login rejected")));

    engine.start(&job).unwrap();
    assert!(job.wait(Duration::from_secs(10)));

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failed_count(), 2);
    assert_eq!(job.snapshot().files_failed, 2);
    assert!(destination.read_file("/d/b").is_none());
    assert_eq!(engine.active_jobs(), 0);
}
