/*!
 * sftp-streamer - play media straight off an SFTP server
 *
 * Turns remote files into seekable byte streams for pull-based media
 * decoders:
 * - Transport session over an authenticated SFTP channel (ssh2 or in-memory)
 * - Remote file handles with blocking and pipelined read modes
 * - Seekable stream adapter and a four-function decoder callback table
 * - Streaming session controller with deterministic teardown
 * - Library sync of seasons and episodes into a repository
 */

pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod player;
pub mod remote;
pub mod stream;

// Re-export commonly used types
pub use config::{PlaybackConfig, StreamerConfig};
pub use error::{Result, StreamerError};
pub use player::{EpisodeRequest, PlaybackState, StreamingController};
pub use remote::{RemoteAttributes, RemoteFileHandle, TransportSession};
pub use stream::{SeekConvention, SeekableStream, SftpStream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
