//! Transport session: directory, stat and open primitives over one channel

use super::file::RemoteFileHandle;
use super::types::{FileType, RemoteAttributes};
use super::{DirRead, SftpChannel};
use crate::error::{Result, StreamerError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bridges a connected [`SftpChannel`] to the file-level operations used by
/// library sync and playback.
///
/// # Thread Safety
///
/// The session can be shared, but the underlying channel is not synchronised
/// for concurrent protocol conversations. Callers serialise: library sync
/// completes before playback starts, and only one playback stream is open at
/// a time.
#[derive(Clone)]
pub struct TransportSession {
    channel: Arc<dyn SftpChannel>,
}

impl TransportSession {
    /// Wrap an authenticated channel
    pub fn new(channel: Arc<dyn SftpChannel>) -> Self {
        Self { channel }
    }

    /// The underlying channel
    pub fn channel(&self) -> &Arc<dyn SftpChannel> {
        &self.channel
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.channel.is_connected() {
            return Err(StreamerError::connection(
                self.channel.endpoint(),
                "channel is not connected",
            ));
        }
        Ok(())
    }

    /// List a remote directory, skipping `.` and `..`
    ///
    /// Each entry's `full_path` is `path + "/" + name`. The directory handle
    /// is closed on every exit path. Fails if the directory cannot be opened
    /// or if the listing does not end in a clean end-of-directory.
    pub fn enumerate_directory(&self, path: &str) -> Result<Vec<RemoteAttributes>> {
        self.ensure_connected()?;
        let mut dir = self.channel.open_dir(path).map_err(|e| match e {
            StreamerError::RemoteIo { message, .. } => StreamerError::remote(
                path,
                format!("Failed to open remote directory: {}", message),
            ),
            other => other,
        })?;

        let mut entries = Vec::new();
        loop {
            match dir.next_entry() {
                Ok(DirRead::Entry { name, stat }) => {
                    if name == "." || name == ".." {
                        continue;
                    }
                    entries.push(RemoteAttributes::from_listing(path, name, stat));
                }
                Ok(DirRead::Eof) => break,
                Err(e) => {
                    if let Err(close_err) = dir.close() {
                        warn!("Failed to close directory {} after error: {}", path, close_err);
                    }
                    return Err(match e {
                        StreamerError::RemoteIo { message, .. } => StreamerError::remote(
                            path,
                            format!("Failed to completely read remote directory: {}", message),
                        ),
                        other => other,
                    });
                }
            }
        }

        dir.close().map_err(|e| {
            StreamerError::remote(path, format!("Failed to close directory: {}", e))
        })?;

        debug!("Enumerated {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    /// Stat a remote path in a single round trip
    pub fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        self.ensure_connected()?;
        let stat = self.channel.stat(path)?;
        Ok(RemoteAttributes::from_stat(path, stat))
    }

    /// Open a remote file read-only
    ///
    /// The file is stat'ed first so the handle knows its size; if the open
    /// itself then fails nothing is left open.
    pub fn open(&self, path: &str) -> Result<RemoteFileHandle> {
        let attributes = self.stat(path)?;
        if attributes.file_type == FileType::Directory {
            return Err(StreamerError::remote(path, "Is a directory"));
        }

        let file = self.channel.open(path).map_err(|e| match e {
            StreamerError::RemoteIo { message, .. } => {
                StreamerError::remote(path, format!("Failed to open: {}", message))
            }
            other => other,
        })?;

        debug!("Opened {} ({} bytes)", path, attributes.size);
        Ok(RemoteFileHandle::new(file, attributes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryChannel;

    fn fixture() -> (MemoryChannel, TransportSession) {
        let channel = MemoryChannel::new();
        channel.add_dir("/lib");
        channel.add_dir("/lib/Season 1");
        channel.add_file("/lib/Season 1/ep1.mkv", &[0u8; 32]);
        channel.add_file("/lib/notes.txt", b"hello");
        let session = TransportSession::new(Arc::new(channel.clone()));
        (channel, session)
    }

    #[test]
    fn test_enumerate_skips_dot_entries() {
        let (channel, session) = fixture();
        let entries = session.enumerate_directory("/lib").unwrap();

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Season 1", "notes.txt"]);
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].full_path, "/lib/notes.txt");
        assert_eq!(entries[1].size, 5);
        assert_eq!(channel.open_dir_count(), 0);
    }

    #[test]
    fn test_enumerate_truncated_listing_fails_and_closes() {
        let (channel, session) = fixture();
        channel.truncate_listings_after(3);

        let err = session.enumerate_directory("/lib").unwrap_err();
        assert!(matches!(err, StreamerError::RemoteIo { .. }));
        assert!(err.to_string().contains("Failed to completely read"));
        assert_eq!(channel.open_dir_count(), 0);
    }

    #[test]
    fn test_enumerate_missing_directory() {
        let (_channel, session) = fixture();
        let err = session.enumerate_directory("/nope").unwrap_err();
        assert!(matches!(err, StreamerError::RemoteIo { .. }));
    }

    #[test]
    fn test_open_populates_size() {
        let (channel, session) = fixture();
        let handle = session.open("/lib/Season 1/ep1.mkv").unwrap();
        assert_eq!(handle.size(), 32);
        assert!(handle.is_open());
        assert_eq!(channel.open_file_count(), 1);
    }

    #[test]
    fn test_open_directory_is_rejected() {
        let (channel, session) = fixture();
        assert!(session.open("/lib").is_err());
        assert_eq!(channel.open_file_count(), 0);
    }

    #[test]
    fn test_operations_on_disconnected_channel() {
        let (channel, session) = fixture();
        channel.disconnect();

        assert!(session.stat("/lib").unwrap_err().is_connection_error());
        assert!(session.enumerate_directory("/lib").unwrap_err().is_connection_error());
        assert!(session.open("/lib/notes.txt").unwrap_err().is_connection_error());
    }
}
