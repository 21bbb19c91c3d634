//! Recursive expansion of a selection into a flat, pre-ordered file list.

use tracing::{debug, warn};

use super::endpoint::{Endpoint, EndpointError, FileMeta, join_path};
use super::models::{EntryId, FileEntry, JobTotals};

/// Flat list produced from a selection, directories before their children.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub entries: Vec<FileEntry>,
    /// Counted over every discovered entry, before conflicts are resolved.
    pub totals: JobTotals,
}

/// Expand `selection` through `source`, recursing into every directory.
///
/// Any listing failure aborts the whole expansion: a job is either built from
/// the complete tree or not at all.
pub fn expand(
    source: &mut dyn Endpoint,
    selection: Vec<FileEntry>,
) -> Result<Expansion, EndpointError> {
    let mut expansion = Expansion::default();

    for mut entry in selection {
        if is_dot_entry(&entry.path) {
            continue;
        }
        entry.parent = None;
        entry.children.clear();
        let id = push(&mut expansion.entries, entry);
        let index = expansion.entries.len() - 1;
        if expansion.entries[index].is_dir {
            expand_directory(source, &mut expansion.entries, id, index)?;
        }
    }

    expansion.totals = JobTotals::from_entries(&expansion.entries);
    debug!(
        total_files = expansion.totals.total_files,
        total_dirs = expansion.totals.total_dirs,
        total_bytes = expansion.totals.total_bytes,
        "Expansion complete"
    );
    Ok(expansion)
}

fn expand_directory(
    source: &mut dyn Endpoint,
    entries: &mut Vec<FileEntry>,
    parent_id: EntryId,
    parent_index: usize,
) -> Result<(), EndpointError> {
    let path = entries[parent_index].path.clone();
    let dest_dir = entries[parent_index].dest_path.clone();

    // Collected up front: the listing borrows the endpoint that recursion needs.
    let mut children: Vec<FileMeta> = source
        .list(&path)
        .map_err(|e| listing_error(&path, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| listing_error(&path, e))?;
    children.sort_by(|a, b| a.name.cmp(&b.name));

    for meta in children {
        if meta.name == "." || meta.name == ".." {
            continue;
        }
        if meta.is_symlink {
            warn!(path = %meta.path, "Skipping symbolic link");
            continue;
        }

        let mut entry = FileEntry::from_meta(&meta, join_path(&dest_dir, &meta.name));
        entry.parent = Some(parent_id);
        let id = push(entries, entry);
        entries[parent_index].children.push(id);

        if meta.is_dir {
            let index = entries.len() - 1;
            expand_directory(source, entries, id, index)?;
        }
    }
    Ok(())
}

fn push(entries: &mut Vec<FileEntry>, mut entry: FileEntry) -> EntryId {
    let id = EntryId(entries.len() as u32);
    entry.id = id;
    entries.push(entry);
    id
}

fn is_dot_entry(path: &str) -> bool {
    matches!(path.rsplit('/').next(), Some(".") | Some(".."))
}

fn listing_error(path: &str, error: EndpointError) -> EndpointError {
    match error {
        EndpointError::Canceled => EndpointError::Canceled,
        other => EndpointError::Fatal(format!("Failed to list {}: {}", path, other)),
    }
}
