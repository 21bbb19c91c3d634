//! Block-by-block copy of one file between two endpoints.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Executor;
use crate::core::endpoint::{EndpointError, EndpointResult, write_all};
use crate::core::models::FileEntry;

/// Copy the entry at `index` from its `start_offset` to the end of the source.
///
/// The token is checked before every read and every write, so a cancel stops
/// the copy within one block.
pub(crate) fn copy_file(
    executor: &mut Executor,
    index: usize,
    token: &CancellationToken,
) -> EndpointResult<()> {
    let entry = executor.job_entry(index);
    let offset = entry.start_offset;
    if offset > entry.size {
        return Err(EndpointError::Fatal(format!(
            "{}: resume offset {} is past the source size {}",
            entry.path, offset, entry.size
        )));
    }

    let opened_at = executor.source.open_read(&entry.path, offset)?;
    if opened_at != offset {
        let _ = executor.source.end_transfer();
        return Err(EndpointError::Fatal(format!(
            "{}: source cannot seek to offset {}",
            entry.path, offset
        )));
    }
    if let Err(e) = executor.destination.open_write(&entry.dest_path, offset) {
        let _ = executor.source.end_transfer();
        return Err(e);
    }
    debug!(file = %entry.path, offset, size = entry.size, "Streams open");

    loop {
        if token.is_cancelled() {
            return Err(EndpointError::Canceled);
        }
        let read = executor.source.read_chunk(&mut executor.buffer)?;
        if read == 0 {
            break;
        }
        if token.is_cancelled() {
            return Err(EndpointError::Canceled);
        }
        write_all(executor.destination.as_mut(), &executor.buffer[..read])?;
        executor.record_chunk(index, read as u64);
    }

    executor.source.end_transfer()?;
    executor.destination.end_transfer()?;

    preserve_metadata(executor, &entry);
    Ok(())
}

/// Apply the source mode and mtime when configured. Failures are logged, the
/// data is already in place.
fn preserve_metadata(executor: &mut Executor, entry: &FileEntry) {
    let (preserve_permissions, preserve_time) = {
        let options = executor.options();
        (options.preserve_permissions, options.preserve_time)
    };
    let capabilities = executor.destination.capabilities();

    if preserve_permissions && capabilities.chmod && entry.mode != 0 {
        if let Err(e) = executor.destination.chmod(&entry.dest_path, entry.mode) {
            warn!(file = %entry.dest_path, error = %e, "Failed to set file permissions");
        }
    }

    if preserve_time && capabilities.set_time {
        if let Some(mtime) = entry.mtime {
            if let Err(e) = executor.destination.set_time(&entry.dest_path, mtime) {
                warn!(file = %entry.dest_path, error = %e, "Failed to preserve file timestamps");
            }
        }
    }
}
