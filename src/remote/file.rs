//! Remote file handle with blocking and pipelined read modes

use super::types::RemoteAttributes;
use super::{AsyncPoll, RemoteFile, RequestId};
use crate::error::{Result, StreamerError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default read-ahead buffer size for pipelined mode
pub const DEFAULT_ASYNC_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct AsyncState {
    buffer: Vec<u8>,
    /// At most one request is ever outstanding
    request: Option<RequestId>,
}

/// One open remote file
///
/// The handle tracks its own cursor: after `seekg(p)` succeeds `tellg() == p`
/// and the next read starts at byte `p`; a read of `n` bytes advances the
/// cursor by exactly `n`. In pipelined mode the server is one request ahead
/// of the cursor, which is why the handle never asks the server for its
/// position.
///
/// Once closed (explicitly, on drop, or after end of file / a fatal
/// pipelined error) every read returns `0`/`Closed` and seeks fail. Closing
/// is idempotent.
///
/// Not safe for concurrent use; the owner serialises calls (a decoder drives
/// one demuxer thread per stream).
pub struct RemoteFileHandle {
    file: Option<Box<dyn RemoteFile>>,
    attributes: RemoteAttributes,
    position: u64,
    async_state: Option<AsyncState>,
}

impl RemoteFileHandle {
    pub(crate) fn new(file: Box<dyn RemoteFile>, attributes: RemoteAttributes) -> Self {
        Self {
            file: Some(file),
            attributes,
            position: 0,
            async_state: None,
        }
    }

    fn closed_error(&self) -> StreamerError {
        StreamerError::Closed {
            path: self.attributes.full_path.clone(),
        }
    }

    /// Blocking read of up to `buf.len()` bytes at the cursor
    ///
    /// Returns the number of bytes read, which may be short. Reading at end of
    /// file returns `Ok(0)` and closes the handle. Protocol errors are logged
    /// with the remote diagnostic and returned; the handle stays open.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.file.is_none() {
            return Err(self.closed_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // A blocking read moves the cursor, so any read-ahead is now stale.
        self.discard_request();

        let position = self.position;
        let result = match self.file.as_mut() {
            Some(file) => file.read_at(position, buf),
            None => return Err(self.closed_error()),
        };

        match result {
            Ok(0) => {
                debug!("End of file reached on {}", self.attributes.full_path);
                self.close();
                Ok(0)
            }
            Ok(n) => {
                self.position += n as u64;
                if self.async_state.is_some() {
                    self.issue_request();
                }
                Ok(n)
            }
            Err(e) => {
                warn!("Error while reading file: {}", e);
                Err(e)
            }
        }
    }

    /// Switch to pipelined mode and issue the first read-ahead request
    ///
    /// Buffers passed to [`RemoteFileHandle::read_async`] should be at least
    /// `buffer_size` bytes.
    pub fn enable_async(&mut self, buffer_size: usize) -> Result<()> {
        if self.file.is_none() {
            return Err(self.closed_error());
        }
        if buffer_size == 0 {
            return Err(StreamerError::Config(
                "async buffer size must be non-zero".to_string(),
            ));
        }

        self.discard_request();
        self.async_state = Some(AsyncState {
            buffer: vec![0; buffer_size],
            request: None,
        });

        let position = self.position;
        let id = match self.file.as_mut() {
            Some(file) => file.begin_read(position, buffer_size)?,
            None => return Err(self.closed_error()),
        };
        if let Some(state) = self.async_state.as_mut() {
            state.request = Some(id);
        }
        debug!(
            "Pipelined reads enabled on {} ({} byte buffer)",
            self.attributes.full_path, buffer_size
        );
        Ok(())
    }

    /// Poll the outstanding pipelined request
    ///
    /// Returns `0` when the data is not ready yet; the caller retries after a
    /// short delay. On success the bytes are copied into `buf`, the next
    /// request is issued immediately and the byte count is returned. End of
    /// file or a protocol error closes the handle, after which this returns
    /// `0` forever.
    pub fn read_async(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || self.file.is_none() {
            return 0;
        }
        let Some(request) = self.async_state.as_ref().map(|s| s.request) else {
            return 0;
        };
        let Some(request) = request else {
            // The previous request could not be issued; try again.
            self.issue_request();
            return 0;
        };

        let (Some(file), Some(state)) = (self.file.as_mut(), self.async_state.as_mut()) else {
            return 0;
        };

        match file.poll_read(request, &mut state.buffer) {
            AsyncPoll::Pending => 0,
            AsyncPoll::Eof => {
                debug!("Pipelined read reached end of {}", self.attributes.full_path);
                self.close();
                0
            }
            AsyncPoll::Failed(message) => {
                warn!(
                    "Pipelined read failed on {}: {}",
                    self.attributes.full_path, message
                );
                self.close();
                0
            }
            AsyncPoll::Ready(n) => {
                let copied = n.min(buf.len());
                buf[..copied].copy_from_slice(&state.buffer[..copied]);
                state.request = None;
                self.position += copied as u64;
                self.issue_request();
                copied
            }
        }
    }

    /// Poll [`RemoteFileHandle::read_async`] until data arrives
    ///
    /// Sleeps `poll_interval` between attempts and gives up after `timeout`.
    /// Returns `Ok(0)` once the handle has closed. Intended for controller-side
    /// consumers; decoder callbacks use the non-blocking form.
    pub fn read_async_blocking(
        &mut self,
        buf: &mut [u8],
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<usize> {
        let started = Instant::now();
        loop {
            let n = self.read_async(buf);
            if n > 0 || !self.is_open() {
                return Ok(n);
            }
            if started.elapsed() >= timeout {
                return Err(StreamerError::remote(
                    &self.attributes.full_path,
                    format!("no read-ahead data after {:?}", timeout),
                ));
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Move the cursor to `offset` bytes from the start of the file
    ///
    /// In pipelined mode the in-flight request is discarded and a fresh one is
    /// issued at the new offset, so stale data is never delivered.
    pub fn seekg(&mut self, offset: u64) -> Result<()> {
        if self.file.is_none() {
            return Err(self.closed_error());
        }
        if offset > self.attributes.size {
            return Err(StreamerError::InvalidSeek {
                offset,
                size: self.attributes.size,
            });
        }

        self.position = offset;
        if self.async_state.is_some() {
            self.discard_request();
            let buffer_size = self.async_buffer_size();
            let id = match self.file.as_mut() {
                Some(file) => file.begin_read(offset, buffer_size)?,
                None => return Err(self.closed_error()),
            };
            if let Some(state) = self.async_state.as_mut() {
                state.request = Some(id);
            }
        }
        Ok(())
    }

    /// Current cursor (0 once closed)
    pub fn tellg(&self) -> u64 {
        if self.file.is_none() {
            return 0;
        }
        self.position
    }

    /// File size from the stat taken at open time
    ///
    /// Not re-queried; if the remote file changes during playback this is
    /// stale.
    pub fn size(&self) -> u64 {
        self.attributes.size
    }

    pub fn attributes(&self) -> &RemoteAttributes {
        &self.attributes
    }

    pub fn path(&self) -> &str {
        &self.attributes.full_path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_async(&self) -> bool {
        self.async_state.is_some()
    }

    /// Size of the pipelined read buffer (0 when not in pipelined mode)
    pub fn async_buffer_size(&self) -> usize {
        self.async_state
            .as_ref()
            .map(|s| s.buffer.len())
            .unwrap_or(0)
    }

    /// Release the remote file; safe to call any number of times
    pub fn close(&mut self) {
        self.discard_request();
        self.async_state = None;
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!("Failed to close {}: {}", self.attributes.full_path, e);
            }
            debug!("Closed {}", self.attributes.full_path);
        }
    }

    fn discard_request(&mut self) {
        let stale = self.async_state.as_mut().and_then(|s| s.request.take());
        if let (Some(id), Some(file)) = (stale, self.file.as_mut()) {
            file.discard(id);
        }
    }

    fn issue_request(&mut self) {
        let position = self.position;
        let buffer_size = self.async_buffer_size();
        let (Some(file), Some(state)) = (self.file.as_mut(), self.async_state.as_mut()) else {
            return;
        };
        match file.begin_read(position, buffer_size) {
            Ok(id) => state.request = Some(id),
            Err(e) => warn!(
                "Failed to issue read-ahead on {} at {}: {}",
                self.attributes.full_path, position, e
            ),
        }
    }
}

impl Drop for RemoteFileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RemoteFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFileHandle")
            .field("path", &self.attributes.full_path)
            .field("size", &self.attributes.size)
            .field("position", &self.position)
            .field("open", &self.is_open())
            .field("async_buffer_size", &self.async_buffer_size())
            .finish()
    }
}
