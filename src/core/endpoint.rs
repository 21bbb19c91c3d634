//! Capability interface implemented by every remote-access protocol.
//!
//! The transfer engine only ever talks to an [`Endpoint`]. Concrete protocols
//! live under `crate::adapters` and are resolved by name through the
//! [`EndpointRegistry`](crate::adapters::EndpointRegistry).

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Result alias for every Endpoint call.
pub type EndpointResult<T> = Result<T, EndpointError>;

/// A lazy, finite listing of one directory. Calling `list` again restarts it.
pub type Listing<'a> = Box<dyn Iterator<Item = EndpointResult<FileMeta>> + 'a>;

/// Failure classes understood by the executor.
///
/// Errors are classified exactly once, where the protocol produced them, and
/// the class is never re-interpreted upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Transient fault: connection reset, mid-transfer timeout, contention.
    #[error("transient failure: {0}")]
    Retryable(String),
    /// Auth rejection, permission denial, protocol violation, local disk error.
    #[error("{0}")]
    Fatal(String),
    #[error("operation canceled")]
    Canceled,
}

/// Where in a session a timeout happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Transfer,
}

impl EndpointError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// A timed out blocking call. Handshake timeouts are not worth retrying.
    pub fn timeout(phase: Phase, after: Duration) -> Self {
        match phase {
            Phase::Handshake => {
                Self::Fatal(format!("handshake timed out after {}s", after.as_secs()))
            }
            Phase::Transfer => {
                Self::Retryable(format!("transfer timed out after {}s", after.as_secs()))
            }
        }
    }

    /// Classify an I/O error raised while performing `what`.
    pub fn from_io(what: &str, err: &io::Error) -> Self {
        if is_transient_io_error(err) {
            Self::Retryable(format!("{}: {}", what, err))
        } else {
            Self::Fatal(format!("{}: {}", what, err))
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Short class name used in structured logs.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "retryable",
            Self::Fatal(_) => "fatal",
            Self::Canceled => "canceled",
        }
    }
}

/// Check if an I/O error is worth a reconnect-and-retry cycle.
fn is_transient_io_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => true,
        ErrorKind::PermissionDenied | ErrorKind::NotFound => false,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EAGAIN
                    | libc::EBUSY
                    | libc::ETXTBSY
                    | libc::ESTALE // NFS handle went away, a remount fixes it
                )
            } else {
                false
            }
        }
    }
}

/// Identity of a session: two endpoints with equal ids may share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EndpointId {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Hash of the secret, so ids can be compared and logged without it.
    #[serde(skip)]
    credential: u64,
}

impl EndpointId {
    pub fn new(protocol: &str, host: &str, port: u16, user: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            user: user.to_string(),
            credential: 0,
        }
    }

    /// Identity of the local filesystem.
    pub fn local() -> Self {
        Self::new("file", "localhost", 0, "")
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        secret.hash(&mut hasher);
        self.credential = hasher.finish();
        self
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}://{}", self.protocol, self.host)?;
        } else {
            write!(f, "{}://{}@{}", self.protocol, self.user, self.host)?;
        }
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// What a protocol can do beyond plain get/put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Reads and writes can start at a nonzero offset.
    pub resume: bool,
    pub chmod: bool,
    pub set_time: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            resume: true,
            chmod: true,
            set_time: true,
        }
    }
}

/// One item of a directory listing, or the result of `stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<SystemTime>,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Cross-thread handle that interrupts an in-progress chunk call.
///
/// The flag is cleared whenever a new read or write stream is opened.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Canceled)` once aborted, for use at the top of chunk calls.
    pub fn check(&self) -> EndpointResult<()> {
        if self.is_aborted() {
            Err(EndpointError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A connected or connectable side of a transfer.
///
/// Implementations are owned by one thread at a time. The only operation that
/// may reach an endpoint from another thread is the [`AbortHandle`].
pub trait Endpoint: Send {
    fn id(&self) -> &EndpointId;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Bound for every blocking call made after this point.
    fn set_timeout(&mut self, timeout: Duration);

    /// Idempotent: connecting a connected endpoint is a no-op.
    fn connect(&mut self) -> EndpointResult<()>;

    /// Idempotent; also drops any open stream.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Entries of one directory, without `.` and `..` guarantees.
    fn list(&mut self, path: &str) -> EndpointResult<Listing<'_>>;

    /// `Ok(None)` when nothing exists at `path`.
    fn stat(&mut self, path: &str) -> EndpointResult<Option<FileMeta>>;

    /// Open `path` for reading at `offset`. Returns the offset actually
    /// reached, which is 0 for a protocol that can only restart.
    fn open_read(&mut self, path: &str, offset: u64) -> EndpointResult<u64>;

    /// Next chunk of the open read stream; `Ok(0)` at end of file.
    fn read_chunk(&mut self, buf: &mut [u8]) -> EndpointResult<usize>;

    /// Open `path` for writing at `offset`, truncating anything past it.
    fn open_write(&mut self, path: &str, offset: u64) -> EndpointResult<()>;

    fn write_chunk(&mut self, buf: &[u8]) -> EndpointResult<usize>;

    /// Close whichever stream is open, committing written data.
    fn end_transfer(&mut self) -> EndpointResult<()>;

    /// Creating an existing directory succeeds.
    fn mkdir(&mut self, path: &str) -> EndpointResult<()>;

    fn remove(&mut self, path: &str) -> EndpointResult<()>;

    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()>;

    fn chmod(&mut self, path: &str, mode: u32) -> EndpointResult<()>;

    fn set_time(&mut self, path: &str, mtime: SystemTime) -> EndpointResult<()>;

    fn abort_handle(&self) -> AbortHandle;
}

/// Write all of `buf`, looping over short writes.
pub fn write_all(endpoint: &mut dyn Endpoint, mut buf: &[u8]) -> EndpointResult<()> {
    while !buf.is_empty() {
        let written = endpoint.write_chunk(buf)?;
        if written == 0 {
            return Err(EndpointError::retryable("endpoint accepted zero bytes"));
        }
        buf = &buf[written..];
    }
    Ok(())
}

/// Join a remote directory path and a child name with `/`.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
