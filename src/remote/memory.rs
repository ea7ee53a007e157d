//! In-memory channel implementation
//!
//! Stores a remote tree in memory and simulates the parts of the SFTP
//! protocol the streaming layer depends on: clean or truncated directory
//! enumeration, request latency for pipelined reads, and dropped connections.
//! Pipelined requests remember the offset they were issued at, so a caller
//! that polls a stale request after seeking observably gets stale bytes.

use super::{AsyncPoll, DirRead, RemoteDir, RemoteFile, RemoteStat, RequestId, SftpChannel};
use crate::error::{Result, StreamerError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Node {
    File(Arc<Vec<u8>>),
    Dir,
    Symlink,
}

#[derive(Debug, Default)]
struct Shared {
    nodes: RwLock<BTreeMap<String, Node>>,
    disconnected: AtomicBool,
    /// Number of `Pending` polls before a pipelined request becomes ready
    latency_polls: AtomicU32,
    fail_reads: AtomicBool,
    /// Listings fail after this many entries (0 = never)
    truncate_listing_after: AtomicUsize,
    open_files: AtomicUsize,
    open_dirs: AtomicUsize,
    requests_issued: AtomicU64,
}

/// In-memory [`SftpChannel`]
///
/// # Example
///
/// ```rust
/// use sftp_streamer::remote::{MemoryChannel, SftpChannel};
///
/// let channel = MemoryChannel::new();
/// channel.add_dir("/library");
/// channel.add_file("/library/a.mkv", b"data");
/// assert_eq!(channel.stat("/library/a.mkv").unwrap().size, 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
}

impl MemoryChannel {
    /// Create an empty, connected channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a regular file
    pub fn add_file(&self, path: impl Into<String>, data: &[u8]) {
        self.shared
            .nodes
            .write()
            .insert(path.into(), Node::File(Arc::new(data.to_vec())));
    }

    /// Add a directory
    pub fn add_dir(&self, path: impl Into<String>) {
        self.shared.nodes.write().insert(path.into(), Node::Dir);
    }

    /// Add a symbolic link entry
    pub fn add_symlink(&self, path: impl Into<String>) {
        self.shared.nodes.write().insert(path.into(), Node::Symlink);
    }

    /// Remove an entry (does not affect already-open files)
    pub fn remove(&self, path: &str) {
        self.shared.nodes.write().remove(path);
    }

    /// Make each pipelined request report `Pending` this many times before completing
    pub fn set_latency(&self, polls: u32) {
        self.shared.latency_polls.store(polls, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with a remote error
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make directory listings fail after `entries` entries (0 disables)
    pub fn truncate_listings_after(&self, entries: usize) {
        self.shared
            .truncate_listing_after
            .store(entries, Ordering::SeqCst);
    }

    /// Number of file handles currently open
    pub fn open_file_count(&self) -> usize {
        self.shared.open_files.load(Ordering::SeqCst)
    }

    /// Number of directory handles currently open
    pub fn open_dir_count(&self) -> usize {
        self.shared.open_dirs.load(Ordering::SeqCst)
    }

    /// Total number of pipelined requests issued so far
    pub fn requests_issued(&self) -> u64 {
        self.shared.requests_issued.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(StreamerError::connection(self.endpoint(), "channel is disconnected"));
        }
        Ok(())
    }

    fn stat_node(node: &Node) -> RemoteStat {
        match node {
            Node::File(data) => RemoteStat::file(data.len() as u64),
            Node::Dir => RemoteStat::directory(),
            Node::Symlink => RemoteStat {
                size: 0,
                file_type: super::FileType::Symlink,
            },
        }
    }
}

impl SftpChannel for MemoryChannel {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::SeqCst)
    }

    fn open_dir(&self, path: &str) -> Result<Box<dyn RemoteDir>> {
        self.ensure_connected()?;
        let nodes = self.shared.nodes.read();
        match nodes.get(path) {
            Some(Node::Dir) => {}
            Some(_) => return Err(StreamerError::remote(path, "Not a directory")),
            None => return Err(StreamerError::remote(path, "No such file")),
        }

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries = vec![
            (".".to_string(), RemoteStat::directory()),
            ("..".to_string(), RemoteStat::directory()),
        ];
        for (child, node) in nodes.range(prefix.clone()..) {
            let Some(name) = child.strip_prefix(&prefix) else {
                break;
            };
            if name.is_empty() || name.contains('/') {
                continue;
            }
            entries.push((name.to_string(), Self::stat_node(node)));
        }

        self.shared.open_dirs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDir {
            path: path.to_string(),
            entries: entries.into_iter(),
            served: 0,
            shared: self.shared.clone(),
            open: true,
        }))
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        self.ensure_connected()?;
        self.shared
            .nodes
            .read()
            .get(path)
            .map(Self::stat_node)
            .ok_or_else(|| StreamerError::remote(path, "No such file"))
    }

    fn open(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
        self.ensure_connected()?;
        let data = match self.shared.nodes.read().get(path) {
            Some(Node::File(data)) => data.clone(),
            Some(_) => return Err(StreamerError::remote(path, "Not a regular file")),
            None => return Err(StreamerError::remote(path, "No such file")),
        };

        self.shared.open_files.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFile {
            path: path.to_string(),
            data,
            shared: self.shared.clone(),
            requests: HashMap::new(),
            next_request: 1,
            open: true,
        }))
    }

    fn disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
    }
}

struct MemoryDir {
    path: String,
    entries: std::vec::IntoIter<(String, RemoteStat)>,
    served: usize,
    shared: Arc<Shared>,
    open: bool,
}

impl RemoteDir for MemoryDir {
    fn next_entry(&mut self) -> Result<DirRead> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(StreamerError::connection("memory", "channel is disconnected"));
        }
        let limit = self.shared.truncate_listing_after.load(Ordering::SeqCst);
        if limit > 0 && self.served >= limit {
            return Err(StreamerError::remote(&self.path, "Connection lost during readdir"));
        }
        match self.entries.next() {
            Some((name, stat)) => {
                self.served += 1;
                Ok(DirRead::Entry { name, stat })
            }
            None => Ok(DirRead::Eof),
        }
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::take(&mut self.open) {
            self.shared.open_dirs.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryDir {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Debug)]
struct PendingRequest {
    offset: u64,
    len: usize,
    polls_left: u32,
}

struct MemoryFile {
    path: String,
    data: Arc<Vec<u8>>,
    shared: Arc<Shared>,
    requests: HashMap<RequestId, PendingRequest>,
    next_request: RequestId,
    open: bool,
}

impl MemoryFile {
    fn copy_from(&self, offset: u64, buf: &mut [u8]) -> usize {
        let len = self.data.len() as u64;
        if offset >= len {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    fn check_usable(&self) -> Result<()> {
        if !self.open {
            return Err(StreamerError::Closed {
                path: self.path.clone(),
            });
        }
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(StreamerError::connection("memory", "channel is disconnected"));
        }
        Ok(())
    }
}

impl RemoteFile for MemoryFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        if self.shared.fail_reads.load(Ordering::SeqCst) {
            return Err(StreamerError::remote(&self.path, "Simulated read failure"));
        }
        Ok(self.copy_from(offset, buf))
    }

    fn begin_read(&mut self, offset: u64, len: usize) -> Result<RequestId> {
        self.check_usable()?;
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(
            id,
            PendingRequest {
                offset,
                len,
                polls_left: self.shared.latency_polls.load(Ordering::SeqCst),
            },
        );
        self.shared.requests_issued.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn poll_read(&mut self, request: RequestId, buf: &mut [u8]) -> AsyncPoll {
        if let Err(e) = self.check_usable() {
            return AsyncPoll::Failed(e.to_string());
        }
        let Some(pending) = self.requests.get_mut(&request) else {
            return AsyncPoll::Failed(format!("unknown request {}", request));
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return AsyncPoll::Pending;
        }
        let Some(PendingRequest { offset, len, .. }) = self.requests.remove(&request) else {
            return AsyncPoll::Failed(format!("unknown request {}", request));
        };
        if self.shared.fail_reads.load(Ordering::SeqCst) {
            return AsyncPoll::Failed("Simulated read failure".to_string());
        }
        let cap = len.min(buf.len());
        match self.copy_from(offset, &mut buf[..cap]) {
            0 => AsyncPoll::Eof,
            n => AsyncPoll::Ready(n),
        }
    }

    fn discard(&mut self, request: RequestId) {
        self.requests.remove(&request);
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::take(&mut self.open) {
            self.requests.clear();
            self.shared.open_files.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
