//! In-memory endpoint with scripted faults, used to exercise the engine
//! without a network.
//!
//! Every [`MemoryEndpoint`] created from one [`MemoryServer`] sees the same
//! tree, whatever host name it was given. The host only changes identity.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::core::endpoint::{
    AbortHandle, Capabilities, Endpoint, EndpointError, EndpointId, EndpointResult, FileMeta,
    Listing, Phase,
};

/// A failure served by the next matching call.
#[derive(Debug, Clone)]
pub enum Fault {
    Connect(EndpointError),
    List(EndpointError),
    Stat(EndpointError),
    Read(EndpointError),
    Write(EndpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Connect,
    List,
    Stat,
    Read,
    Write,
}

impl Fault {
    fn op(&self) -> Op {
        match self {
            Fault::Connect(_) => Op::Connect,
            Fault::List(_) => Op::List,
            Fault::Stat(_) => Op::Stat,
            Fault::Read(_) => Op::Read,
            Fault::Write(_) => Op::Write,
        }
    }

    fn into_error(self) -> EndpointError {
        match self {
            Fault::Connect(e) | Fault::List(e) | Fault::Stat(e) | Fault::Read(e) | Fault::Write(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    is_dir: bool,
    mode: u32,
    mtime: SystemTime,
}

impl Node {
    fn file(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            is_dir: false,
            mode: 0o644,
            mtime: SystemTime::now(),
        }
    }

    fn dir() -> Self {
        Self {
            data: Vec::new(),
            is_dir: true,
            mode: 0o755,
            mtime: SystemTime::now(),
        }
    }
}

/// A fault that lets `skip` matching calls succeed first.
#[derive(Debug)]
struct Scheduled {
    fault: Fault,
    skip: usize,
}

#[derive(Debug)]
struct ServerState {
    nodes: BTreeMap<String, Node>,
    faults: VecDeque<Scheduled>,
    read_delay: Duration,
    capabilities: Capabilities,
    connects: usize,
    disconnects: usize,
    bytes_written: u64,
}

impl Default for ServerState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::dir());
        Self {
            nodes,
            faults: VecDeque::new(),
            read_delay: Duration::ZERO,
            capabilities: Capabilities::default(),
            connects: 0,
            disconnects: 0,
            bytes_written: 0,
        }
    }
}

impl ServerState {
    fn take_fault(&mut self, op: Op) -> EndpointResult<()> {
        let Some(index) = self.faults.iter().position(|s| s.fault.op() == op) else {
            return Ok(());
        };
        if self.faults[index].skip > 0 {
            self.faults[index].skip -= 1;
            return Ok(());
        }
        match self.faults.remove(index) {
            Some(scheduled) => Err(scheduled.fault.into_error()),
            None => Ok(()),
        }
    }

    fn make_parents(&mut self, path: &str) {
        let mut parent = parent_of(path);
        while let Some(dir) = parent {
            self.nodes.entry(dir.to_string()).or_insert_with(Node::dir);
            parent = parent_of(dir);
        }
    }

    fn meta(&self, path: &str) -> Option<FileMeta> {
        self.nodes.get(path).map(|node| FileMeta {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            size: node.data.len() as u64,
            mode: node.mode,
            mtime: Some(node.mtime),
            is_dir: node.is_dir,
            is_symlink: false,
        })
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(index) => Some(&trimmed[..index]),
    }
}

/// Shared file tree plus fault script and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state();
        state.make_parents(path);
        state.nodes.insert(path.to_string(), Node::file(data));
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state();
        state.make_parents(path);
        state.nodes.insert(path.to_string(), Node::dir());
    }

    pub fn set_mtime(&self, path: &str, mtime: SystemTime) {
        if let Some(node) = self.state().nodes.get_mut(path) {
            node.mtime = mtime;
        }
    }

    /// Queue a fault for the next call of the matching kind.
    pub fn inject(&self, fault: Fault) {
        self.inject_after(0, fault);
    }

    /// Queue a fault served after `calls` matching calls have succeeded.
    pub fn inject_after(&self, calls: usize, fault: Fault) {
        self.state().faults.push_back(Scheduled { fault, skip: calls });
    }

    /// Delay added to every chunk read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = delay;
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state().capabilities = capabilities;
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state()
            .nodes
            .get(path)
            .filter(|node| !node.is_dir)
            .map(|node| node.data.clone())
    }

    pub fn meta(&self, path: &str) -> Option<FileMeta> {
        self.state().meta(path)
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    /// An endpoint on this tree identified as `mem://<host>`.
    pub fn endpoint(&self, host: &str) -> MemoryEndpoint {
        MemoryEndpoint {
            server: self.clone(),
            id: EndpointId::new("mem", host, 0, ""),
            connected: false,
            timeout: Duration::from_secs(30),
            abort: AbortHandle::default(),
            stream: None,
        }
    }
}

#[derive(Debug)]
enum Stream {
    Read { path: String, pos: usize },
    Write { path: String, pos: usize },
}

#[derive(Debug)]
pub struct MemoryEndpoint {
    server: MemoryServer,
    id: EndpointId,
    connected: bool,
    timeout: Duration,
    abort: AbortHandle,
    stream: Option<Stream>,
}

impl MemoryEndpoint {
    /// Lock the tree, failing like a dropped session when disconnected.
    fn online(&self) -> EndpointResult<MutexGuard<'_, ServerState>> {
        if !self.connected {
            return Err(EndpointError::retryable(format!("{} is not connected", self.id)));
        }
        Ok(self.server.state())
    }
}

impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.server.state().capabilities
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn connect(&mut self) -> EndpointResult<()> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.server.state();
        state.take_fault(Op::Connect)?;
        state.connects += 1;
        drop(state);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
        if self.connected {
            self.connected = false;
            self.server.state().disconnects += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn list(&mut self, path: &str) -> EndpointResult<Listing<'_>> {
        let mut state = self.online()?;
        state.take_fault(Op::List)?;
        match state.nodes.get(path) {
            Some(node) if node.is_dir => {}
            Some(_) => return Err(EndpointError::fatal(format!("{}: not a directory", path))),
            None => return Err(EndpointError::fatal(format!("{}: no such directory", path))),
        }

        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let children: Vec<EndpointResult<FileMeta>> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/') && key.len() > prefix.len())
            .filter_map(|(key, _)| state.meta(key))
            .map(Ok)
            .collect();
        Ok(Box::new(children.into_iter()))
    }

    fn stat(&mut self, path: &str) -> EndpointResult<Option<FileMeta>> {
        let mut state = self.online()?;
        state.take_fault(Op::Stat)?;
        Ok(state.meta(path))
    }

    fn open_read(&mut self, path: &str, offset: u64) -> EndpointResult<u64> {
        let size = {
            let state = self.online()?;
            match state.nodes.get(path) {
                Some(node) if !node.is_dir => node.data.len() as u64,
                Some(_) => return Err(EndpointError::fatal(format!("{}: is a directory", path))),
                None => return Err(EndpointError::fatal(format!("{}: no such file", path))),
            }
        };
        if offset > size {
            return Err(EndpointError::fatal(format!(
                "{}: offset {} past end of file",
                path, offset
            )));
        }
        self.abort.clear();
        self.stream = Some(Stream::Read {
            path: path.to_string(),
            pos: offset as usize,
        });
        Ok(offset)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> EndpointResult<usize> {
        self.abort.check()?;
        let delay = self.online()?.read_delay;
        if !delay.is_zero() {
            if delay >= self.timeout {
                std::thread::sleep(self.timeout);
                return Err(EndpointError::timeout(Phase::Transfer, self.timeout));
            }
            std::thread::sleep(delay);
            self.abort.check()?;
        }

        self.online()?;
        let mut state = self.server.state();
        state.take_fault(Op::Read)?;
        let Some(Stream::Read { path, pos }) = self.stream.as_mut() else {
            return Err(EndpointError::fatal("no read stream open"));
        };
        let Some(node) = state.nodes.get(path.as_str()) else {
            return Err(EndpointError::fatal(format!("{}: vanished while reading", path)));
        };
        let start = (*pos).min(node.data.len());
        let n = (node.data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&node.data[start..start + n]);
        *pos = start + n;
        Ok(n)
    }

    fn open_write(&mut self, path: &str, offset: u64) -> EndpointResult<()> {
        {
            let mut state = self.online()?;
            let existing = state.nodes.get(path).map(|n| (n.is_dir, n.data.len() as u64));
            match existing {
                Some((true, _)) => {
                    return Err(EndpointError::fatal(format!("{}: is a directory", path)));
                }
                Some((false, len)) if offset > len => {
                    return Err(EndpointError::fatal(format!(
                        "{}: cannot write at {} past end {}",
                        path, offset, len
                    )));
                }
                None if offset > 0 => {
                    return Err(EndpointError::fatal(format!("{}: no file to resume", path)));
                }
                _ => {}
            }
            state.make_parents(path);
            let node = state
                .nodes
                .entry(path.to_string())
                .or_insert_with(|| Node::file(&[]));
            node.data.truncate(offset as usize);
            node.mtime = SystemTime::now();
        }
        self.abort.clear();
        self.stream = Some(Stream::Write {
            path: path.to_string(),
            pos: offset as usize,
        });
        Ok(())
    }

    fn write_chunk(&mut self, buf: &[u8]) -> EndpointResult<usize> {
        self.abort.check()?;
        self.online()?;
        let mut state = self.server.state();
        state.take_fault(Op::Write)?;
        let Some(Stream::Write { path, pos }) = self.stream.as_mut() else {
            return Err(EndpointError::fatal("no write stream open"));
        };
        let Some(node) = state.nodes.get_mut(path.as_str()) else {
            return Err(EndpointError::fatal(format!("{}: vanished while writing", path)));
        };
        node.data.truncate(*pos);
        node.data.extend_from_slice(buf);
        *pos += buf.len();
        state.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn end_transfer(&mut self) -> EndpointResult<()> {
        self.stream = None;
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> EndpointResult<()> {
        let mut state = self.online()?;
        if let Some(node) = state.nodes.get(path) {
            if node.is_dir {
                return Ok(());
            }
            return Err(EndpointError::fatal(format!("{}: file exists", path)));
        }
        state.make_parents(path);
        state.nodes.insert(path.to_string(), Node::dir());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> EndpointResult<()> {
        let mut state = self.online()?;
        state
            .nodes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| EndpointError::fatal(format!("{}: no such file", path)))
    }

    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()> {
        let mut state = self.online()?;
        let node = state
            .nodes
            .remove(from)
            .ok_or_else(|| EndpointError::fatal(format!("{}: no such file", from)))?;
        state.make_parents(to);
        state.nodes.insert(to.to_string(), node);
        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> EndpointResult<()> {
        let mut state = self.online()?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| EndpointError::fatal(format!("{}: no such file", path)))?;
        node.mode = mode;
        Ok(())
    }

    fn set_time(&mut self, path: &str, mtime: SystemTime) -> EndpointResult<()> {
        let mut state = self.online()?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| EndpointError::fatal(format!("{}: no such file", path)))?;
        node.mtime = mtime;
        Ok(())
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}
