//! Seekable stream adapter over a remote file handle
//!
//! Byte-oriented decoders want exactly four operations: read, seek, tell and
//! size. [`SftpStream`] provides them over a [`RemoteFileHandle`] using plain
//! integer sentinels (negative = error), and never panics or propagates a
//! `Result` across that boundary. It also implements `std::io::Read` and
//! `std::io::Seek` for Rust-native consumers.

pub mod callbacks;

pub use callbacks::{CallbackContext, CallbackStats, CallbackTable, MediaSource};

use crate::error::StreamerError;
use crate::remote::RemoteFileHandle;
use std::io;

/// Minimal seekable byte stream contract
///
/// All methods return a negative value on error.
pub trait SeekableStream: Send {
    /// Read up to `data.len()` bytes; returns the count (0 at end of stream)
    fn read(&mut self, data: &mut [u8]) -> i64;

    /// Move to `position` bytes from the start
    ///
    /// The meaning of a non-negative return depends on the stream's
    /// [`SeekConvention`].
    fn seek(&mut self, position: i64) -> i64;

    /// Current position
    fn tell(&mut self) -> i64;

    /// Total size in bytes
    fn size(&mut self) -> i64;
}

/// What a successful seek returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekConvention {
    /// The position actually sought to (`-1` on failure)
    #[default]
    Position,

    /// `0` on success, `-1` on failure
    Status,
}

impl SeekConvention {
    fn report(self, position: u64) -> i64 {
        match self {
            SeekConvention::Position => position as i64,
            SeekConvention::Status => 0,
        }
    }
}

/// [`SeekableStream`] over an exclusively owned [`RemoteFileHandle`]
///
/// Move-only: the handle wraps a single remote file and is closed when the
/// stream is dropped.
#[derive(Debug)]
pub struct SftpStream {
    handle: RemoteFileHandle,
    convention: SeekConvention,
}

impl SftpStream {
    /// Wrap a handle using the position-returning seek convention
    pub fn new(handle: RemoteFileHandle) -> Self {
        Self::with_convention(handle, SeekConvention::Position)
    }

    pub fn with_convention(handle: RemoteFileHandle, convention: SeekConvention) -> Self {
        Self { handle, convention }
    }

    pub fn convention(&self) -> SeekConvention {
        self.convention
    }

    pub fn handle(&self) -> &RemoteFileHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut RemoteFileHandle {
        &mut self.handle
    }

    /// Close the underlying handle early
    pub fn close(&mut self) {
        self.handle.close();
    }
}

impl SeekableStream for SftpStream {
    fn read(&mut self, data: &mut [u8]) -> i64 {
        match self.handle.read(data) {
            Ok(n) => n as i64,
            Err(StreamerError::Closed { .. }) => 0,
            Err(_) => -1,
        }
    }

    fn seek(&mut self, position: i64) -> i64 {
        if position < 0 {
            return -1;
        }
        match self.handle.seekg(position as u64) {
            Ok(()) => self.convention.report(position as u64),
            Err(e) => {
                tracing::debug!("Seek to {} failed: {}", position, e);
                -1
            }
        }
    }

    fn tell(&mut self) -> i64 {
        self.handle.tellg() as i64
    }

    fn size(&mut self) -> i64 {
        self.handle.size() as i64
    }
}

impl io::Read for SftpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.handle.read(buf) {
            Ok(n) => Ok(n),
            Err(StreamerError::Closed { .. }) => Ok(0),
            Err(StreamerError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

impl io::Seek for SftpStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::Current(delta) => self.handle.tellg().checked_add_signed(delta),
            io::SeekFrom::End(delta) => self.handle.size().checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.handle
            .seekg(target)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(target)
    }
}
