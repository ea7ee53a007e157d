/*!
 * sftp-streamer CLI
 *
 * Operator tool for the streaming core: list and stat remote paths, stream
 * a byte range to stdout through a remote file handle, and run a library
 * sync.
 */

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sftp_streamer::{
    config::{SftpConfig, StreamerConfig},
    error::{StreamerError, EXIT_FATAL, EXIT_SUCCESS},
    library::{Library, MemoryRepository},
    logging,
    remote::{join_remote, SftpChannel, SshChannel, TransportSession},
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sftp-streamer")]
#[command(version, about = "Stream media files from an SFTP server", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/sftp-streamer/config.toml)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Server URI overriding the [sftp] section (sftp://user@host:port)
    #[arg(long = "uri", value_name = "URI", global = true)]
    uri: Option<String>,

    /// Enable debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List a remote directory
    Ls {
        /// Remote path; relative paths are taken from the library root
        path: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show attributes of a remote path
    Stat {
        path: String,

        #[arg(long)]
        json: bool,
    },

    /// Stream a remote file (or a byte range of it) to stdout
    Cat {
        path: String,

        /// Start offset in bytes
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to write (default: to end of file)
        #[arg(long)]
        length: Option<u64>,

        /// Use pipelined reads with this buffer size
        #[arg(long, value_name = "BYTES")]
        async_buffer: Option<usize>,
    },

    /// Sync the library into an in-memory repository and report changes
    Sync {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<StreamerError>()
                .map(StreamerError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => StreamerConfig::default_path()
            .context("Could not determine the configuration directory; pass --config")?,
    };

    if let Commands::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            bail!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            );
        }
        StreamerConfig::default().to_file(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let mut config = if cli.uri.is_some() && !config_path.exists() {
        StreamerConfig::default()
    } else {
        StreamerConfig::load_or_create(&config_path)?
    };
    if let Some(ref uri) = cli.uri {
        let (sftp, _path) = SftpConfig::from_uri(uri)?;
        config.sftp = sftp;
    }
    config.logging.verbose |= cli.verbose;
    config.validate()?;
    logging::init_logging(&config.logging)?;

    let channel = Arc::new(SshChannel::connect(&config.sftp.to_ssh_config())?);
    let session = Arc::new(TransportSession::new(channel.clone()));

    let result = match cli.command {
        Commands::InitConfig { .. } => Ok(()),
        Commands::Ls { path, json } => {
            let path = path.unwrap_or_else(|| config.library.location.clone());
            list(&session, &resolve(&config, &path), json)
        }
        Commands::Stat { path, json } => stat(&session, &resolve(&config, &path), json),
        Commands::Cat {
            path,
            offset,
            length,
            async_buffer,
        } => cat(
            &session,
            &config,
            &resolve(&config, &path),
            offset,
            length,
            async_buffer,
        ),
        Commands::Sync { json } => sync(&session, &config, json),
    };

    channel.disconnect();
    result
}

/// Relative paths are taken from the library root
fn resolve(config: &StreamerConfig, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        join_remote(config.library.location.trim_end_matches('/'), path)
    }
}

fn list(session: &TransportSession, path: &str, json: bool) -> anyhow::Result<()> {
    let mut entries = session.enumerate_directory(path)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:<8} {:>14}  {}",
            entry.file_type.to_string(),
            entry.size,
            entry.name
        );
    }
    Ok(())
}

fn stat(session: &TransportSession, path: &str, json: bool) -> anyhow::Result<()> {
    let attributes = session.stat(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&attributes)?);
    } else {
        println!("path: {}", attributes.full_path);
        println!("type: {}", attributes.file_type);
        println!("size: {}", attributes.size);
    }
    Ok(())
}

fn cat(
    session: &TransportSession,
    config: &StreamerConfig,
    path: &str,
    offset: u64,
    length: Option<u64>,
    async_buffer: Option<usize>,
) -> anyhow::Result<()> {
    let mut handle = session.open(path)?;
    handle.seekg(offset)?;

    let buffer_size = async_buffer.unwrap_or(config.playback.async_buffer_size);
    if async_buffer.is_some() {
        handle.enable_async(buffer_size)?;
    }
    let timeout = Duration::from_secs(config.sftp.timeout_secs);
    let poll_interval = config.playback.poll_interval();

    let mut remaining = length.unwrap_or(u64::MAX);
    let mut buf = vec![0u8; buffer_size];
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    while remaining > 0 && handle.is_open() {
        let n = if handle.is_async() {
            handle.read_async_blocking(&mut buf, poll_interval, timeout)?
        } else {
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            handle.read(&mut buf[..want])?
        };
        if n == 0 {
            break;
        }
        let take = n.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        out.write_all(&buf[..take])?;
        remaining -= take as u64;
    }
    out.flush()?;
    Ok(())
}

fn sync(session: &Arc<TransportSession>, config: &StreamerConfig, json: bool) -> anyhow::Result<()> {
    let mut library = Library::new(
        config.library.location.clone(),
        session.clone(),
        MemoryRepository::new(),
    );
    let report = library.sync()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for season in &report.seasons_added {
        println!("+ season  {}", season);
    }
    for season in &report.seasons_skipped {
        println!("  skipped {} (no playable media)", season);
    }
    for episode in &report.episodes_added {
        println!("+ episode {}", episode);
    }
    for episode in &report.episodes_removed {
        println!("- episode {}", episode);
    }
    let repository = library.into_repository();
    println!(
        "{} seasons, {} episodes",
        repository.season_count(),
        repository.episode_count()
    );
    Ok(())
}
