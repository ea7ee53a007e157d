//! Remote file access over an authenticated SFTP channel
//!
//! The transport seam is split in two traits:
//! - [`SftpChannel`]: one authenticated connection (directory, stat and open primitives)
//! - [`RemoteFile`]: one open remote file with positioned blocking reads and
//!   pipelined (poll-based) reads
//!
//! [`TransportSession`] and [`RemoteFileHandle`] build the streaming semantics
//! on top of these primitives. Two channel implementations exist:
//! - `SshChannel`: ssh2-backed, for real servers (requires `ssh-backend`)
//! - [`MemoryChannel`]: in-memory tree with simulated latency, used as a fixture

pub mod file;
pub mod memory;
pub mod session;
#[cfg(feature = "ssh-backend")]
pub mod ssh;
pub mod types;

pub use file::RemoteFileHandle;
pub use memory::MemoryChannel;
pub use session::TransportSession;
#[cfg(feature = "ssh-backend")]
pub use ssh::{SshAuth, SshChannel, SshConfig};
pub use types::{join_remote, FileType, RemoteAttributes, RemoteStat};

use crate::error::Result;

/// Token identifying one outstanding pipelined read request
pub type RequestId = u64;

/// Result of reading one directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirRead {
    /// Next entry of the listing, `.` and `..` included
    Entry { name: String, stat: RemoteStat },

    /// The server reported a clean end of the listing
    Eof,
}

/// Result of polling an outstanding pipelined read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncPoll {
    /// `n` bytes were copied into the caller's buffer
    Ready(usize),

    /// The response has not arrived yet; poll again later
    Pending,

    /// The request started at or beyond end of file
    Eof,

    /// The request failed; carries the remote diagnostic
    Failed(String),
}

/// An open remote directory handle
pub trait RemoteDir: Send {
    /// Read the next entry
    fn next_entry(&mut self) -> Result<DirRead>;

    /// Release the native directory handle
    fn close(&mut self) -> Result<()>;
}

/// An open remote file
///
/// Implementations are not internally synchronised for concurrent callers;
/// the owning handle serialises access.
pub trait RemoteFile: Send {
    /// Blocking read of up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns `Ok(0)` at end of file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Issue a pipelined read request for `len` bytes at `offset`
    ///
    /// The request is in flight when this returns; its result is collected
    /// with [`RemoteFile::poll_read`].
    fn begin_read(&mut self, offset: u64, len: usize) -> Result<RequestId>;

    /// Non-blocking check of an outstanding request
    fn poll_read(&mut self, request: RequestId, buf: &mut [u8]) -> AsyncPoll;

    /// Forget an outstanding request whose result is no longer wanted
    fn discard(&mut self, _request: RequestId) {}

    /// Release the native file handle
    fn close(&mut self) -> Result<()>;
}

/// One authenticated connection to a remote server
///
/// Every operation fails with `StreamerError::Connection` once the channel
/// is disconnected. The channel is shared, but callers serialise their use of
/// it (one playback stream at a time, library sync before playback).
pub trait SftpChannel: Send + Sync {
    /// `host:port` description used in diagnostics
    fn endpoint(&self) -> String;

    /// Whether the channel is still connected and authenticated
    fn is_connected(&self) -> bool;

    /// Open a directory for enumeration
    fn open_dir(&self, path: &str) -> Result<Box<dyn RemoteDir>>;

    /// Single round-trip stat
    fn stat(&self, path: &str) -> Result<RemoteStat>;

    /// Open a file read-only
    fn open(&self, path: &str) -> Result<Box<dyn RemoteFile>>;

    /// Tear down the connection; later operations fail
    fn disconnect(&self);
}
