//! Local filesystem endpoint.

use std::fs::{self, File, Metadata, OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tracing::debug;

use crate::core::endpoint::{
    AbortHandle, Endpoint, EndpointError, EndpointId, EndpointResult, FileMeta, Listing,
};

pub struct LocalEndpoint {
    id: EndpointId,
    connected: bool,
    /// fsync every written file before `end_transfer` returns.
    sync_files: bool,
    abort: AbortHandle,
    reader: Option<File>,
    writer: Option<File>,
}

impl LocalEndpoint {
    pub fn new(sync_files: bool) -> Self {
        Self {
            id: EndpointId::local(),
            connected: false,
            sync_files,
            abort: AbortHandle::default(),
            reader: None,
            writer: None,
        }
    }
}

fn meta_from(path: &Path, metadata: &Metadata) -> FileMeta {
    FileMeta {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_string_lossy().into_owned(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mode: metadata.permissions().mode() & 0o7777,
        mtime: metadata.modified().ok(),
        is_dir: metadata.is_dir(),
        is_symlink: metadata.file_type().is_symlink(),
    }
}

impl Endpoint for LocalEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    // Local calls are not bounded by a network timeout.
    fn set_timeout(&mut self, _timeout: Duration) {}

    fn connect(&mut self) -> EndpointResult<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.reader = None;
        self.writer = None;
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn list(&mut self, path: &str) -> EndpointResult<Listing<'_>> {
        let entries =
            fs::read_dir(path).map_err(|e| EndpointError::from_io(&format!("list {}", path), &e))?;
        Ok(Box::new(entries.map(|entry| -> EndpointResult<FileMeta> {
            let entry = entry.map_err(|e| EndpointError::from_io("read directory entry", &e))?;
            let path = entry.path();
            let metadata = fs::symlink_metadata(&path)
                .map_err(|e| EndpointError::from_io(&format!("stat {}", path.display()), &e))?;
            Ok(meta_from(&path, &metadata))
        })))
    }

    fn stat(&mut self, path: &str) -> EndpointResult<Option<FileMeta>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(meta_from(Path::new(path), &metadata))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EndpointError::from_io(&format!("stat {}", path), &e)),
        }
    }

    fn open_read(&mut self, path: &str, offset: u64) -> EndpointResult<u64> {
        let io_err = |e| EndpointError::from_io(&format!("open {}", path), &e);
        let mut file = File::open(path).map_err(io_err)?;
        let reached = file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        self.abort.clear();
        self.reader = Some(file);
        Ok(reached)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> EndpointResult<usize> {
        self.abort.check()?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| EndpointError::fatal("no read stream open"))?;
        reader
            .read(buf)
            .map_err(|e| EndpointError::from_io("read", &e))
    }

    fn open_write(&mut self, path: &str, offset: u64) -> EndpointResult<()> {
        let io_err = |e| EndpointError::from_io(&format!("open {} for writing", path), &e);
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(path)
            .map_err(io_err)?;
        if offset > 0 {
            let len = file.metadata().map_err(io_err)?.len();
            if len < offset {
                return Err(EndpointError::fatal(format!(
                    "{}: cannot resume at {} past end {}",
                    path, offset, len
                )));
            }
            file.set_len(offset).map_err(io_err)?;
            file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        }
        debug!(path, offset, "Opened local file for writing");
        self.abort.clear();
        self.writer = Some(file);
        Ok(())
    }

    fn write_chunk(&mut self, buf: &[u8]) -> EndpointResult<usize> {
        self.abort.check()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EndpointError::fatal("no write stream open"))?;
        writer
            .write(buf)
            .map_err(|e| EndpointError::from_io("write", &e))
    }

    fn end_transfer(&mut self) -> EndpointResult<()> {
        self.reader = None;
        if let Some(mut file) = self.writer.take() {
            file.flush()
                .map_err(|e| EndpointError::from_io("flush", &e))?;
            if self.sync_files {
                file.sync_all()
                    .map_err(|e| EndpointError::from_io("sync", &e))?;
            }
        }
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> EndpointResult<()> {
        fs::create_dir_all(path).map_err(|e| EndpointError::from_io(&format!("mkdir {}", path), &e))
    }

    fn remove(&mut self, path: &str) -> EndpointResult<()> {
        let io_err = |e| EndpointError::from_io(&format!("remove {}", path), &e);
        let metadata = fs::symlink_metadata(path).map_err(io_err)?;
        if metadata.is_dir() {
            fs::remove_dir(path).map_err(io_err)
        } else {
            fs::remove_file(path).map_err(io_err)
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()> {
        fs::rename(from, to)
            .map_err(|e| EndpointError::from_io(&format!("rename {} to {}", from, to), &e))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> EndpointResult<()> {
        fs::set_permissions(path, Permissions::from_mode(mode))
            .map_err(|e| EndpointError::from_io(&format!("chmod {}", path), &e))
    }

    fn set_time(&mut self, path: &str, mtime: SystemTime) -> EndpointResult<()> {
        filetime::set_file_mtime(path, FileTime::from_system_time(mtime))
            .map_err(|e| EndpointError::from_io(&format!("set mtime on {}", path), &e))
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_stat_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let mut endpoint = LocalEndpoint::new(false);
        endpoint.connect().unwrap();
        assert_eq!(endpoint.stat(&path(&dir, "nope")).unwrap(), None);
    }

    #[test]
    fn test_list_reports_symlinks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        let mut endpoint = LocalEndpoint::new(false);
        endpoint.connect().unwrap();

        let mut items: Vec<FileMeta> = endpoint
            .list(&dir.path().to_string_lossy())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(items.len(), 2);
        assert!(items[0].is_symlink);
        assert!(!items[1].is_symlink);
    }

    #[test]
    fn test_write_resumes_at_offset() {
        let dir = TempDir::new().unwrap();
        let target = path(&dir, "out.bin");
        fs::write(&target, b"hello, garbage").unwrap();
        let mut endpoint = LocalEndpoint::new(true);
        endpoint.connect().unwrap();

        endpoint.open_write(&target, 7).unwrap();
        endpoint.write_chunk(b"world").unwrap();
        endpoint.end_transfer().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello, world");
    }

    #[test]
    fn test_resume_past_end_is_fatal() {
        let dir = TempDir::new().unwrap();
        let target = path(&dir, "short");
        fs::write(&target, b"ab").unwrap();
        let mut endpoint = LocalEndpoint::new(false);
        endpoint.connect().unwrap();
        assert!(matches!(
            endpoint.open_write(&target, 10),
            Err(EndpointError::Fatal(_))
        ));
    }

    #[test]
    fn test_read_from_offset() {
        let dir = TempDir::new().unwrap();
        let source = path(&dir, "in");
        fs::write(&source, b"0123456789").unwrap();
        let mut endpoint = LocalEndpoint::new(false);
        endpoint.connect().unwrap();

        assert_eq!(endpoint.open_read(&source, 4).unwrap(), 4);
        let mut buf = [0u8; 16];
        let n = endpoint.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"456789");
    }
}
