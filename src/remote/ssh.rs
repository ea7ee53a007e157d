//! SSH/SFTP channel implementation
//!
//! Provides blocking access to a remote filesystem over SSH using the SFTP
//! protocol, built on the `ssh2` crate.

use super::types::{FileType, RemoteStat};
use super::{AsyncPoll, DirRead, RemoteDir, RemoteFile, RequestId, SftpChannel};
use crate::error::{Result, StreamerError};
use secrecy::{ExposeSecret, SecretString};
use ssh2::{ErrorCode, Session, Sftp};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// libssh2 reports end of a directory listing as LIBSSH2_ERROR_FILE
const LIBSSH2_ERROR_FILE: i32 = -16;

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(SecretString),

    /// Public key authentication with private key file
    KeyFile {
        /// Path to private key file
        key_path: PathBuf,
        /// Optional passphrase for the key
        passphrase: Option<SecretString>,
    },

    /// SSH agent authentication
    Agent,
}

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Hostname or IP address
    pub host: String,

    /// Port (default: 22)
    pub port: u16,

    /// Username
    pub username: String,

    /// Authentication method
    pub auth: SshAuth,

    /// Connection and per-request timeout in seconds
    pub timeout_secs: u64,

    /// Compression enabled
    pub compress: bool,
}

impl SshConfig {
    /// Create a new SSH configuration
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            timeout_secs: 30,
            compress: false,
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Enable compression
    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SFTP channel over one authenticated SSH session
///
/// # Thread Safety
///
/// `ssh2` serialises access to the session internally, but the SFTP
/// conversation is not designed for interleaved use: pipelined reads switch
/// the session to non-blocking mode for the duration of a single poll.
/// Callers keep to one active stream per channel.
pub struct SshChannel {
    endpoint: String,
    session: Session,
    sftp: Arc<Sftp>,
    connected: AtomicBool,
}

impl SshChannel {
    /// Connect, handshake, authenticate and start the SFTP subsystem
    ///
    /// Blocks for up to the configured timeout.
    pub fn connect(config: &SshConfig) -> Result<Self> {
        let addr = config.endpoint();
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| StreamerError::connection(&addr, e.to_string()))?;

        let timeout = std::time::Duration::from_secs(config.timeout_secs);
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();

        let mut session = Session::new().map_err(|e| {
            StreamerError::connection(&addr, format!("Failed to create SSH session: {}", e))
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(config.timeout_secs));
        session.set_compress(config.compress);

        session
            .handshake()
            .map_err(|e| StreamerError::connection(&addr, e.to_string()))?;

        authenticate(&session, config)?;

        if !session.authenticated() {
            return Err(StreamerError::Authentication(
                "Authentication failed".to_string(),
            ));
        }

        if let Some(banner) = session.banner() {
            debug!("Server banner: {}", banner);
        }

        let sftp = session.sftp().map_err(|e| {
            StreamerError::connection(&addr, format!("Failed to open SFTP channel: {}", e))
        })?;

        info!("Connected to {} as {}", addr, config.username);
        Ok(Self {
            endpoint: addr,
            session,
            sftp: Arc::new(sftp),
            connected: AtomicBool::new(true),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(StreamerError::connection(
                &self.endpoint,
                "SSH session is disconnected",
            ));
        }
        Ok(())
    }
}

fn authenticate(session: &Session, config: &SshConfig) -> Result<()> {
    match &config.auth {
        SshAuth::Password(password) => {
            session
                .userauth_password(&config.username, password.expose_secret())
                .map_err(|e| {
                    StreamerError::Authentication(format!(
                        "Password authentication failed: {}",
                        e
                    ))
                })?;
        }
        SshAuth::KeyFile {
            key_path,
            passphrase,
        } => {
            let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret());
            session
                .userauth_pubkey_file(&config.username, None, key_path, pass)
                .map_err(|e| {
                    StreamerError::Authentication(format!(
                        "Key file authentication failed: {}",
                        e
                    ))
                })?;
        }
        SshAuth::Agent => {
            let mut agent = session.agent().map_err(|e| {
                StreamerError::Authentication(format!("Failed to connect to SSH agent: {}", e))
            })?;
            agent.connect().map_err(|e| {
                StreamerError::Authentication(format!("Failed to connect to SSH agent: {}", e))
            })?;
            agent.list_identities().map_err(|e| {
                StreamerError::Authentication(format!(
                    "Failed to list SSH agent identities: {}",
                    e
                ))
            })?;
            let identities = agent.identities().map_err(|e| {
                StreamerError::Authentication(format!(
                    "Failed to get SSH agent identities: {}",
                    e
                ))
            })?;

            let authenticated = identities
                .iter()
                .any(|identity| agent.userauth(&config.username, identity).is_ok());
            if !authenticated {
                return Err(StreamerError::Authentication(
                    "No valid identity found in SSH agent".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Convert an ssh2 stat into the channel-level snapshot
/// Session timeout in the milliseconds libssh2 expects, saturating
fn timeout_ms(secs: u64) -> u32 {
    u32::try_from(secs.saturating_mul(1000)).unwrap_or(u32::MAX)
}

fn convert_stat(stat: &ssh2::FileStat) -> RemoteStat {
    let file_type = match stat.file_type() {
        ssh2::FileType::RegularFile => FileType::Regular,
        ssh2::FileType::Directory => FileType::Directory,
        ssh2::FileType::Symlink => FileType::Symlink,
        ssh2::FileType::NamedPipe
        | ssh2::FileType::CharDevice
        | ssh2::FileType::BlockDevice
        | ssh2::FileType::Socket => FileType::Special,
        ssh2::FileType::Other(_) => FileType::Unknown,
    };
    RemoteStat {
        size: stat.size.unwrap_or(0),
        file_type,
    }
}

impl SftpChannel for SshChannel {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.session.authenticated()
    }

    fn open_dir(&self, path: &str) -> Result<Box<dyn RemoteDir>> {
        self.ensure_connected()?;
        trace!("opendir {}", path);
        let dir = self
            .sftp
            .opendir(Path::new(path))
            .map_err(|e| StreamerError::remote(path, e.message()))?;
        Ok(Box::new(SshDir {
            path: path.to_string(),
            dir: Some(dir),
        }))
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        self.ensure_connected()?;
        trace!("stat {}", path);
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| StreamerError::remote(path, e.message()))?;
        Ok(convert_stat(&stat))
    }

    fn open(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
        self.ensure_connected()?;
        trace!("open {}", path);
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| StreamerError::remote(path, e.message()))?;
        Ok(Box::new(SshFile {
            path: path.to_string(),
            session: self.session.clone(),
            file: Some(file),
            cursor: 0,
            staging: Vec::new(),
            pending: None,
            next_request: 1,
        }))
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.session.disconnect(None, "Closing connection", None);
            info!("Disconnected from {}", self.endpoint);
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct SshDir {
    path: String,
    dir: Option<ssh2::File>,
}

impl RemoteDir for SshDir {
    fn next_entry(&mut self) -> Result<DirRead> {
        let Some(dir) = self.dir.as_mut() else {
            return Err(StreamerError::Closed {
                path: self.path.clone(),
            });
        };
        match dir.readdir() {
            Ok((name, stat)) => Ok(DirRead::Entry {
                name: name.to_string_lossy().into_owned(),
                stat: convert_stat(&stat),
            }),
            Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_FILE) => Ok(DirRead::Eof),
            Err(e) => Err(StreamerError::remote(&self.path, e.message())),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut dir) = self.dir.take() {
            dir.close()
                .map_err(|e| StreamerError::remote(&self.path, e.message()))?;
        }
        Ok(())
    }
}

/// Progress of the one outstanding read-ahead
#[derive(Debug)]
enum Staged {
    /// Sent to the server, response not complete yet
    InFlight,
    /// `n` bytes sit in the staging buffer
    Filled(usize),
    Eof,
    Failed(String),
}

#[derive(Debug)]
struct PendingRead {
    id: RequestId,
    staged: Staged,
}

/// Open SFTP file
///
/// libssh2 keeps its own read-ahead window keyed on the file position, so
/// the local `cursor` mirrors that position and the file is only re-seeked
/// (which flushes the window) when a read starts somewhere else.
///
/// A read-ahead is a non-blocking libssh2 read into `staging`. The first
/// attempt happens in `begin_read`, which puts the request on the wire.
/// libssh2 resumes the same request on each later attempt as long as it is
/// offered the same buffer, so the staging buffer is untouched until the
/// request completes or is discarded.
struct SshFile {
    path: String,
    session: Session,
    file: Option<ssh2::File>,
    cursor: u64,
    staging: Vec<u8>,
    pending: Option<PendingRead>,
    next_request: RequestId,
}

impl SshFile {
    fn file_at(&mut self, offset: u64) -> Result<&mut ssh2::File> {
        let Some(file) = self.file.as_mut() else {
            return Err(StreamerError::Closed {
                path: self.path.clone(),
            });
        };
        if offset != self.cursor {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StreamerError::remote(&self.path, e.to_string()))?;
            self.cursor = offset;
        }
        Ok(file)
    }

    /// One non-blocking attempt at an in-flight read-ahead
    fn advance_pending(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if !matches!(pending.staged, Staged::InFlight) {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            pending.staged = Staged::Failed(format!("{} is closed", self.path));
            return;
        };

        self.session.set_blocking(false);
        let result = file.read(&mut self.staging);
        self.session.set_blocking(true);

        pending.staged = match result {
            Ok(0) => Staged::Eof,
            Ok(n) => {
                self.cursor += n as u64;
                Staged::Filled(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Staged::InFlight,
            Err(e) => Staged::Failed(e.to_string()),
        };
    }

    /// Drop the read-ahead; an unfinished one is flushed from libssh2
    fn drop_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if !matches!(pending.staged, Staged::InFlight) {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            // Seeking discards the outstanding packets
            if let Err(e) = file.seek(SeekFrom::Start(self.cursor)) {
                warn!("Failed to flush read-ahead on {}: {}", self.path, e);
            }
        }
    }
}

impl RemoteFile for SshFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.drop_pending();
        let path = self.path.clone();
        let file = self.file_at(offset)?;
        let n = file
            .read(buf)
            .map_err(|e| StreamerError::remote(path, e.to_string()))?;
        self.cursor += n as u64;
        Ok(n)
    }

    fn begin_read(&mut self, offset: u64, len: usize) -> Result<RequestId> {
        self.drop_pending();
        self.file_at(offset)?;

        let id = self.next_request;
        self.next_request += 1;
        self.staging.clear();
        self.staging.resize(len, 0);
        self.pending = Some(PendingRead {
            id,
            staged: Staged::InFlight,
        });
        self.advance_pending();

        trace!("read-ahead #{} {} bytes at {} on {}", id, len, offset, self.path);
        Ok(id)
    }

    fn poll_read(&mut self, request: RequestId, buf: &mut [u8]) -> AsyncPoll {
        if self.pending.as_ref().map(|p| p.id) != Some(request) {
            return AsyncPoll::Failed(format!("stale read request {}", request));
        }
        self.advance_pending();
        if matches!(
            self.pending.as_ref().map(|p| &p.staged),
            Some(Staged::InFlight)
        ) {
            return AsyncPoll::Pending;
        }

        let Some(pending) = self.pending.take() else {
            return AsyncPoll::Failed(format!("stale read request {}", request));
        };
        match pending.staged {
            Staged::Filled(n) => {
                let cap = n.min(buf.len());
                buf[..cap].copy_from_slice(&self.staging[..cap]);
                if cap < n {
                    // The caller's buffer was short; re-seek before the next read
                    self.cursor -= (n - cap) as u64;
                    if let Some(file) = self.file.as_mut() {
                        if let Err(e) = file.seek(SeekFrom::Start(self.cursor)) {
                            return AsyncPoll::Failed(e.to_string());
                        }
                    }
                }
                AsyncPoll::Ready(cap)
            }
            Staged::Eof => AsyncPoll::Eof,
            Staged::Failed(message) => AsyncPoll::Failed(message),
            Staged::InFlight => AsyncPoll::Pending,
        }
    }

    fn discard(&mut self, request: RequestId) {
        if self.pending.as_ref().map(|p| p.id) == Some(request) {
            debug!("Discarding read-ahead #{} on {}", request, self.path);
            self.drop_pending();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        if let Some(mut file) = self.file.take() {
            file.close()
                .map_err(|e| StreamerError::remote(&self.path, e.message()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_saturates() {
        assert_eq!(timeout_ms(30), 30_000);
        assert_eq!(timeout_ms(4_294_968), u32::MAX);
        assert_eq!(timeout_ms(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_ssh_config_defaults() {
        let config = SshConfig::new("example.com", "user", SshAuth::Agent);
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.compress);
        assert_eq!(config.endpoint(), "example.com:22");
    }

    #[test]
    fn test_ssh_config_builder() {
        let config = SshConfig::new("example.com", "user", SshAuth::Agent)
            .with_port(2222)
            .with_timeout(5)
            .with_compression();
        assert_eq!(config.endpoint(), "example.com:2222");
        assert_eq!(config.timeout_secs, 5);
        assert!(config.compress);
    }

    #[test]
    fn test_connect_refused_is_connection_error() {
        // Port 1 on localhost is essentially never listening
        let config = SshConfig::new("127.0.0.1", "user", SshAuth::Agent)
            .with_port(1)
            .with_timeout(1);
        match SshChannel::connect(&config) {
            Err(e) => assert!(e.is_connection_error()),
            Ok(_) => panic!("expected connection failure"),
        }
    }
}
