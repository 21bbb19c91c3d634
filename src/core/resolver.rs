//! Overwrite/Resume/Skip decisions for files that already exist at the destination.

use std::time::SystemTime;

use tracing::{debug, warn};

use super::endpoint::{Endpoint, EndpointError, FileMeta};
use super::models::{ConflictAction, FileEntry, JobId};
use super::options::{ConflictPolicy, TransferOptions};
use super::progress::{ConflictQuery, ProgressSink};

/// Resolver settings taken from [`TransferOptions`].
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub policy: ConflictPolicy,
    pub overwrite_default: bool,
    pub compare_mtime: bool,
}

impl From<&TransferOptions> for ResolverSettings {
    fn from(options: &TransferOptions) -> Self {
        Self {
            policy: options.conflict_policy,
            overwrite_default: options.overwrite_default,
            compare_mtime: options.compare_mtime,
        }
    }
}

/// Result of a resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub conflicts: usize,
    pub prompts: usize,
}

/// Suggested action for `entry` given what exists at its destination.
pub fn suggest(
    entry: &FileEntry,
    existing: &FileMeta,
    can_resume: bool,
    settings: &ResolverSettings,
) -> ConflictAction {
    if settings.compare_mtime && existing.size == entry.size && !is_older(existing.mtime, entry.mtime)
    {
        return ConflictAction::Skip;
    }
    if can_resume && !settings.overwrite_default && existing.size < entry.size {
        ConflictAction::Resume
    } else {
        ConflictAction::Overwrite
    }
}

fn is_older(dest: Option<SystemTime>, source: Option<SystemTime>) -> bool {
    match (dest, source) {
        (Some(dest), Some(source)) => dest < source,
        _ => true,
    }
}

/// Set `action` and `start_offset` on every entry, asking `sink` where the
/// policy says so.
///
/// Entries whose destination is missing, a directory, or empty are plain
/// Overwrites. Once a decision carries "apply to all", the remaining
/// conflicts in this pass take that action with no further queries.
pub fn resolve(
    job_id: JobId,
    entries: &mut [FileEntry],
    destination: &mut dyn Endpoint,
    can_resume: bool,
    settings: &ResolverSettings,
    sink: &dyn ProgressSink,
) -> Result<Resolution, EndpointError> {
    let mut resolution = Resolution::default();
    let mut apply_all: Option<ConflictAction> = settings.policy.fixed_action();

    for entry in entries.iter_mut() {
        entry.action = ConflictAction::Overwrite;
        entry.start_offset = 0;
        if entry.is_dir {
            continue;
        }

        let existing = match destination.stat(&entry.dest_path) {
            Ok(Some(meta)) => meta,
            Ok(None) => continue,
            Err(EndpointError::Canceled) => return Err(EndpointError::Canceled),
            Err(e) if !destination.is_connected() => return Err(e),
            Err(e) => {
                warn!(file = %entry.dest_path, error = %e, "Cannot inspect destination");
                entry.action = ConflictAction::Error;
                entry.error = Some(e.to_string());
                continue;
            }
        };
        if existing.is_dir || existing.size == 0 {
            continue;
        }

        resolution.conflicts += 1;
        let suggested = suggest(entry, &existing, can_resume, settings);
        let mut action = match (apply_all, settings.policy) {
            (Some(action), _) => action,
            (None, ConflictPolicy::Ask) => {
                resolution.prompts += 1;
                let decision = sink.conflict_detected(&ConflictQuery {
                    job_id,
                    file: entry.clone(),
                    dest_size: existing.size,
                    suggested,
                    can_resume,
                });
                if decision.apply_to_all {
                    apply_all = Some(decision.action);
                }
                decision.action
            }
            (None, _) => suggested,
        };

        if action == ConflictAction::Resume && !can_resume {
            action = ConflictAction::Overwrite;
        }
        // Resume only appends; a destination at least as long has nothing to resume.
        if action == ConflictAction::Resume && existing.size >= entry.size {
            action = if existing.size == entry.size {
                ConflictAction::Skip
            } else {
                ConflictAction::Overwrite
            };
        }
        if action == ConflictAction::Resume {
            entry.start_offset = existing.size;
        }
        entry.action = action;
        debug!(
            file = %entry.dest_path,
            dest_size = existing.size,
            action = ?action,
            "Resolved conflict"
        );
    }

    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryServer;
    use crate::core::progress::{ConflictDecision, NullSink};
    use std::sync::Mutex;

    /// Answers every query from a script and records how often it was asked.
    struct ScriptedSink {
        answers: Mutex<Vec<ConflictDecision>>,
        asked: Mutex<usize>,
    }

    impl ScriptedSink {
        fn new(mut answers: Vec<ConflictDecision>) -> Self {
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
                asked: Mutex::new(0),
            }
        }

        fn asked(&self) -> usize {
            *self.asked.lock().unwrap()
        }
    }

    impl ProgressSink for ScriptedSink {
        fn conflict_detected(&self, query: &ConflictQuery) -> ConflictDecision {
            *self.asked.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(ConflictDecision::once(query.suggested))
        }
    }

    fn settings(policy: ConflictPolicy) -> ResolverSettings {
        ResolverSettings {
            policy,
            overwrite_default: false,
            compare_mtime: false,
        }
    }

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry::new("/s/a", "/d/a", 100),
            FileEntry::new("/s/b", "/d/b", 50),
            FileEntry::new("/s/c", "/d/c", 10),
            FileEntry::new("/s/new", "/d/new", 10),
        ]
    }

    fn destination() -> MemoryServer {
        let server = MemoryServer::new();
        server.add_file("/d/a", &[0u8; 40]);
        server.add_file("/d/b", &[0u8; 80]);
        server.add_file("/d/c", &[0u8; 5]);
        server
    }

    #[test]
    fn test_suggested_policy_prefers_resume_for_smaller_destination() {
        let server = destination();
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let mut list = entries();

        let resolution = resolve(
            JobId::new(),
            &mut list,
            &mut dest,
            true,
            &settings(ConflictPolicy::Suggested),
            &NullSink,
        )
        .unwrap();

        assert_eq!(resolution.conflicts, 3);
        assert_eq!(resolution.prompts, 0);
        assert_eq!(list[0].action, ConflictAction::Resume);
        assert_eq!(list[0].start_offset, 40);
        assert_eq!(list[1].action, ConflictAction::Overwrite);
        assert_eq!(list[1].start_offset, 0);
        assert_eq!(list[3].action, ConflictAction::Overwrite);
    }

    #[test]
    fn test_overwrite_default_disables_resume_suggestion() {
        let server = destination();
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let mut list = entries();
        let mut s = settings(ConflictPolicy::Suggested);
        s.overwrite_default = true;

        resolve(JobId::new(), &mut list, &mut dest, true, &s, &NullSink).unwrap();
        assert_eq!(list[0].action, ConflictAction::Overwrite);
    }

    #[test]
    fn test_apply_to_all_skip_stops_asking() {
        let server = destination();
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let mut list = entries();
        let sink = ScriptedSink::new(vec![ConflictDecision::for_all(ConflictAction::Skip)]);

        let resolution = resolve(
            JobId::new(),
            &mut list,
            &mut dest,
            true,
            &settings(ConflictPolicy::Ask),
            &sink,
        )
        .unwrap();

        assert_eq!(sink.asked(), 1);
        assert_eq!(resolution.prompts, 1);
        assert!(list[..3].iter().all(|e| e.action == ConflictAction::Skip));
        assert_eq!(list[3].action, ConflictAction::Overwrite);
    }

    #[test]
    fn test_resume_downgraded_without_capability() {
        let server = destination();
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let mut list = entries();

        resolve(
            JobId::new(),
            &mut list,
            &mut dest,
            false,
            &settings(ConflictPolicy::Resume),
            &NullSink,
        )
        .unwrap();
        assert!(list[..3].iter().all(|e| e.action == ConflictAction::Overwrite));
    }

    #[test]
    fn test_forced_resume_never_past_source_end() {
        let server = MemoryServer::new();
        server.add_file("/d/longer", &[0u8; 4096]);
        server.add_file("/d/same", &[0u8; 10]);
        server.add_file("/d/shorter", &[0u8; 3]);
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let mut list = vec![
            FileEntry::new("/s/longer", "/d/longer", 5),
            FileEntry::new("/s/same", "/d/same", 10),
            FileEntry::new("/s/shorter", "/d/shorter", 10),
        ];
        let sink = ScriptedSink::new(vec![ConflictDecision::for_all(ConflictAction::Resume)]);

        resolve(
            JobId::new(),
            &mut list,
            &mut dest,
            true,
            &settings(ConflictPolicy::Ask),
            &sink,
        )
        .unwrap();

        assert_eq!(list[0].action, ConflictAction::Overwrite);
        assert_eq!(list[0].start_offset, 0);
        assert_eq!(list[1].action, ConflictAction::Skip);
        assert_eq!(list[1].start_offset, 0);
        assert_eq!(list[2].action, ConflictAction::Resume);
        assert_eq!(list[2].start_offset, 3);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let server = destination();
        let mut dest = server.endpoint("dst");
        dest.connect().unwrap();
        let s = settings(ConflictPolicy::Suggested);

        let mut first = entries();
        resolve(JobId::new(), &mut first, &mut dest, true, &s, &NullSink).unwrap();
        let mut second = first.clone();
        resolve(JobId::new(), &mut second, &mut dest, true, &s, &NullSink).unwrap();

        let actions = |l: &[FileEntry]| {
            l.iter()
                .map(|e| (e.action, e.start_offset))
                .collect::<Vec<_>>()
        };
        assert_eq!(actions(&first), actions(&second));
    }

    #[test]
    fn test_compare_mtime_skips_identical_file() {
        let now = SystemTime::now();
        let entry = FileEntry::new("/s/a", "/d/a", 10).with_mtime(now);
        let existing = FileMeta {
            name: "a".into(),
            path: "/d/a".into(),
            size: 10,
            mode: 0o644,
            mtime: Some(now),
            is_dir: false,
            is_symlink: false,
        };
        let mut s = settings(ConflictPolicy::Suggested);
        s.compare_mtime = true;
        assert_eq!(suggest(&entry, &existing, true, &s), ConflictAction::Skip);

        s.compare_mtime = false;
        assert_eq!(suggest(&entry, &existing, true, &s), ConflictAction::Overwrite);
    }
}
