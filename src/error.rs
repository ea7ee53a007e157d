/*!
 * Error types for the SFTP streamer
 */

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, StreamerError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum StreamerError {
    /// Channel is not connected or the connection attempt failed
    Connection { endpoint: String, message: String },

    /// Authentication against the SSH server failed
    Authentication(String),

    /// A stat/open/enumerate/read request failed at the protocol level
    RemoteIo { path: String, message: String },

    /// Operation attempted on a closed remote file handle
    Closed { path: String },

    /// Seek target lies outside of the file
    InvalidSeek { offset: u64, size: u64 },

    /// The remote file could not be opened for playback
    PlaybackOpen {
        path: String,
        source: Box<StreamerError>,
    },

    /// The media decoder reported a failure
    Decoder(String),

    /// Playback action is not valid in the current controller state
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    /// Configuration error
    Config(String),

    /// Local I/O error
    Io(io::Error),
}

impl StreamerError {
    /// Build a `RemoteIo` error from a path and the remote diagnostic
    pub fn remote(path: impl Into<String>, message: impl Into<String>) -> Self {
        StreamerError::RemoteIo {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a `Connection` error
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        StreamerError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StreamerError::Connection { .. }
            | StreamerError::Authentication(_)
            | StreamerError::Config(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is transient (temporary, worth retrying by the user)
    ///
    /// Nothing in the crate retries internally; this only drives how the
    /// failure is presented.
    pub fn is_transient(&self) -> bool {
        match self {
            StreamerError::Io(io_err) => {
                use io::ErrorKind::*;
                matches!(
                    io_err.kind(),
                    ConnectionReset | ConnectionAborted | TimedOut | Interrupted | WouldBlock
                )
            }
            StreamerError::RemoteIo { .. } => true,
            StreamerError::PlaybackOpen { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this error means the channel itself is unusable
    pub fn is_connection_error(&self) -> bool {
        match self {
            StreamerError::Connection { .. } | StreamerError::Authentication(_) => true,
            StreamerError::PlaybackOpen { source, .. } => source.is_connection_error(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamerError::Connection { .. } => ErrorCategory::Network,
            StreamerError::Authentication(_) => ErrorCategory::Security,
            StreamerError::RemoteIo { .. } | StreamerError::Closed { .. } => {
                ErrorCategory::RemoteIo
            }
            StreamerError::InvalidSeek { .. } => ErrorCategory::Validation,
            StreamerError::PlaybackOpen { .. }
            | StreamerError::Decoder(_)
            | StreamerError::InvalidState { .. } => ErrorCategory::Playback,
            StreamerError::Config(_) => ErrorCategory::Configuration,
            StreamerError::Io(_) => ErrorCategory::IoError,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection/transport errors
    Network,
    /// Authentication errors
    Security,
    /// Remote file protocol errors
    RemoteIo,
    /// Argument validation errors
    Validation,
    /// Playback lifecycle errors
    Playback,
    /// Configuration errors
    Configuration,
    /// Local I/O errors
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::RemoteIo => write!(f, "remote-io"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Playback => write!(f, "playback"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

impl fmt::Display for StreamerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamerError::Connection { endpoint, message } => {
                write!(f, "Connection to {} failed: {}", endpoint, message)
            }
            StreamerError::Authentication(msg) => {
                write!(f, "Authentication error: {}", msg)
            }
            StreamerError::RemoteIo { path, message } => {
                write!(f, "Remote I/O error on {}: {}", path, message)
            }
            StreamerError::Closed { path } => {
                write!(f, "Remote file is closed: {}", path)
            }
            StreamerError::InvalidSeek { offset, size } => {
                write!(f, "Cannot seek to {} in a {} byte file", offset, size)
            }
            StreamerError::PlaybackOpen { path, source } => {
                write!(f, "Failed to open {} for playback: {}", path, source)
            }
            StreamerError::Decoder(msg) => {
                write!(f, "Decoder error: {}", msg)
            }
            StreamerError::InvalidState { state, action } => {
                write!(f, "Cannot {} while {}", action, state)
            }
            StreamerError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            StreamerError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
        }
    }
}

impl std::error::Error for StreamerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamerError::Io(err) => Some(err),
            StreamerError::PlaybackOpen { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for StreamerError {
    fn from(err: io::Error) -> Self {
        StreamerError::Io(err)
    }
}

impl From<toml::de::Error> for StreamerError {
    fn from(err: toml::de::Error) -> Self {
        StreamerError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for StreamerError {
    fn from(err: toml::ser::Error) -> Self {
        StreamerError::Config(format!("TOML serialize error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = StreamerError::remote("/media/show/ep1.mkv", "No such file");
        assert_eq!(
            err.to_string(),
            "Remote I/O error on /media/show/ep1.mkv: No such file"
        );
        assert_eq!(err.category(), ErrorCategory::RemoteIo);
    }

    #[test]
    fn test_playback_open_wraps_source() {
        use std::error::Error;

        let err = StreamerError::PlaybackOpen {
            path: "/a.mkv".to_string(),
            source: Box::new(StreamerError::remote("/a.mkv", "gone")),
        };
        assert!(err.source().is_some());
        assert!(err.is_transient());
        assert!(!err.is_connection_error());
        assert_eq!(err.category(), ErrorCategory::Playback);
    }

    #[test]
    fn test_connection_errors_are_fatal() {
        let err = StreamerError::connection("host:22", "refused");
        assert!(err.is_connection_error());
        assert_eq!(err.exit_code(), EXIT_FATAL);
        assert_eq!(err.category().to_string(), "network");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = StreamerError::InvalidState {
            state: "idle",
            action: "pause",
        };
        assert_eq!(err.to_string(), "Cannot pause while idle");
    }

    #[test]
    fn test_io_conversion() {
        let err: StreamerError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_transient());
        assert_eq!(err.exit_code(), EXIT_PARTIAL);
    }
}
