//! Library sync: mirror the remote season/episode tree into a repository
//!
//! The library root holds one directory per season, each containing the
//! episode files. [`Library::sync`] removes seasons that vanished remotely,
//! adds new season directories (those with at least one playable file) and
//! adds new episodes to every known season. Storage goes through the
//! [`LibraryRepository`] trait; [`MemoryRepository`] is the bundled store.

use crate::error::StreamerError;
use crate::player::{SessionSummary, StopReason, TRACK_UNSET};
use crate::remote::{RemoteAttributes, TransportSession};
use crate::stream::{SeekableStream, SftpStream};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File extensions considered playable
pub const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonEntry {
    pub id: i64,
    /// Full remote path of the season directory
    pub filepath: String,
    pub name: String,
    /// Encoded cover image (empty when none was generated)
    #[serde(skip)]
    pub thumbnail: Vec<u8>,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeEntry {
    pub id: i64,
    pub season_id: i64,
    pub filepath: String,
    pub name: String,
    pub watched: bool,
    /// Resume position in milliseconds
    pub offset_ms: u64,
    pub audio_track: i32,
    pub subtitle_track: i32,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchHistoryEntry {
    pub id: i64,
    pub episode_id: i64,
    pub watched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: i64 },

    #[error("a {kind} for {filepath} already exists")]
    Duplicate { kind: &'static str, filepath: String },

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Remote(#[from] StreamerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type LibraryResult<T> = std::result::Result<T, LibraryError>;

type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Season, episode and watch-history storage
///
/// Ids are assigned by the repository on create; the `id` field of the
/// entry passed in is ignored.
pub trait LibraryRepository: Send {
    fn seasons(&self) -> RepoResult<Vec<SeasonEntry>>;
    fn season(&self, id: i64) -> RepoResult<Option<SeasonEntry>>;
    fn season_by_path(&self, filepath: &str) -> RepoResult<Option<SeasonEntry>>;
    fn create_season(&mut self, entry: SeasonEntry) -> RepoResult<i64>;
    fn delete_season(&mut self, id: i64) -> RepoResult<()>;

    fn episodes_in_season(&self, season_id: i64) -> RepoResult<Vec<EpisodeEntry>>;
    fn episode(&self, id: i64) -> RepoResult<Option<EpisodeEntry>>;
    fn episode_by_path(&self, filepath: &str) -> RepoResult<Option<EpisodeEntry>>;
    fn create_episode(&mut self, entry: EpisodeEntry) -> RepoResult<i64>;
    fn update_episode(&mut self, entry: &EpisodeEntry) -> RepoResult<()>;
    fn delete_episode(&mut self, id: i64) -> RepoResult<()>;

    /// Newest first
    fn watch_history(&self) -> RepoResult<Vec<WatchHistoryEntry>>;
    fn create_watch_entry(&mut self, entry: WatchHistoryEntry) -> RepoResult<i64>;
    fn delete_watch_entry(&mut self, id: i64) -> RepoResult<()>;
}

/// In-memory [`LibraryRepository`]
#[derive(Debug, Default)]
pub struct MemoryRepository {
    seasons: BTreeMap<i64, SeasonEntry>,
    episodes: BTreeMap<i64, EpisodeEntry>,
    history: BTreeMap<i64, WatchHistoryEntry>,
    next_id: i64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn season_count(&self) -> usize {
        self.seasons.len()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }
}

impl LibraryRepository for MemoryRepository {
    fn seasons(&self) -> RepoResult<Vec<SeasonEntry>> {
        Ok(self.seasons.values().cloned().collect())
    }

    fn season(&self, id: i64) -> RepoResult<Option<SeasonEntry>> {
        Ok(self.seasons.get(&id).cloned())
    }

    fn season_by_path(&self, filepath: &str) -> RepoResult<Option<SeasonEntry>> {
        Ok(self
            .seasons
            .values()
            .find(|s| s.filepath == filepath)
            .cloned())
    }

    fn create_season(&mut self, mut entry: SeasonEntry) -> RepoResult<i64> {
        if self.season_by_path(&entry.filepath)?.is_some() {
            return Err(RepositoryError::Duplicate {
                kind: "season",
                filepath: entry.filepath,
            });
        }
        let id = self.allocate_id();
        entry.id = id;
        self.seasons.insert(id, entry);
        Ok(id)
    }

    fn delete_season(&mut self, id: i64) -> RepoResult<()> {
        self.seasons
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound { kind: "season", id })
    }

    fn episodes_in_season(&self, season_id: i64) -> RepoResult<Vec<EpisodeEntry>> {
        Ok(self
            .episodes
            .values()
            .filter(|e| e.season_id == season_id)
            .cloned()
            .collect())
    }

    fn episode(&self, id: i64) -> RepoResult<Option<EpisodeEntry>> {
        Ok(self.episodes.get(&id).cloned())
    }

    fn episode_by_path(&self, filepath: &str) -> RepoResult<Option<EpisodeEntry>> {
        Ok(self
            .episodes
            .values()
            .find(|e| e.filepath == filepath)
            .cloned())
    }

    fn create_episode(&mut self, mut entry: EpisodeEntry) -> RepoResult<i64> {
        if self.episode_by_path(&entry.filepath)?.is_some() {
            return Err(RepositoryError::Duplicate {
                kind: "episode",
                filepath: entry.filepath,
            });
        }
        if !self.seasons.contains_key(&entry.season_id) {
            return Err(RepositoryError::NotFound {
                kind: "season",
                id: entry.season_id,
            });
        }
        let id = self.allocate_id();
        entry.id = id;
        self.episodes.insert(id, entry);
        Ok(id)
    }

    fn update_episode(&mut self, entry: &EpisodeEntry) -> RepoResult<()> {
        match self.episodes.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                kind: "episode",
                id: entry.id,
            }),
        }
    }

    fn delete_episode(&mut self, id: i64) -> RepoResult<()> {
        self.episodes
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound { kind: "episode", id })
    }

    fn watch_history(&self) -> RepoResult<Vec<WatchHistoryEntry>> {
        let mut entries: Vec<_> = self.history.values().cloned().collect();
        entries.sort_by(|a, b| b.watched_at.cmp(&a.watched_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    fn create_watch_entry(&mut self, mut entry: WatchHistoryEntry) -> RepoResult<i64> {
        let id = self.allocate_id();
        entry.id = id;
        self.history.insert(id, entry);
        Ok(id)
    }

    fn delete_watch_entry(&mut self, id: i64) -> RepoResult<()> {
        self.history
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound {
                kind: "watch history entry",
                id,
            })
    }
}

/// Produces a season cover image from a media stream
///
/// Decoding frames is the decoder's business; implementations pull bytes
/// through the stream and return an encoded image.
pub trait Thumbnailer {
    fn generate(&self, stream: &mut dyn SeekableStream) -> crate::error::Result<Vec<u8>>;
}

/// Thumbnailer that never produces an image
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThumbnails;

impl Thumbnailer for NoThumbnails {
    fn generate(&self, _stream: &mut dyn SeekableStream) -> crate::error::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// What one sync pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub seasons_added: Vec<String>,
    pub seasons_removed: Vec<String>,
    pub seasons_skipped: Vec<String>,
    pub episodes_added: Vec<String>,
    pub episodes_removed: Vec<String>,
}

fn is_media_file(attributes: &RemoteAttributes) -> bool {
    attributes.is_file()
        && attributes
            .name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| {
                MEDIA_EXTENSIONS
                    .iter()
                    .any(|m| ext.eq_ignore_ascii_case(m))
            })
}

/// The user's media library backed by a remote directory tree
pub struct Library<R, T = NoThumbnails> {
    root: String,
    session: Arc<TransportSession>,
    repository: R,
    thumbnailer: T,
}

impl<R: LibraryRepository> Library<R, NoThumbnails> {
    pub fn new(root: impl Into<String>, session: Arc<TransportSession>, repository: R) -> Self {
        Self {
            root: root.into(),
            session,
            repository,
            thumbnailer: NoThumbnails,
        }
    }
}

impl<R: LibraryRepository, T: Thumbnailer> Library<R, T> {
    pub fn with_thumbnailer<U: Thumbnailer>(self, thumbnailer: U) -> Library<R, U> {
        Library {
            root: self.root,
            session: self.session,
            repository: self.repository,
            thumbnailer,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    /// Bring the repository in line with the remote tree
    ///
    /// Failing to list the library root aborts the sync. A season directory
    /// that cannot be listed is logged and skipped.
    pub fn sync(&mut self) -> LibraryResult<SyncReport> {
        info!("Syncing library at {}", self.root);
        let mut report = SyncReport::default();
        let root_list = self.session.enumerate_directory(&self.root)?;
        let on_disk: HashSet<&str> = root_list
            .iter()
            .filter(|a| a.is_dir())
            .map(|a| a.full_path.as_str())
            .collect();

        for season in self.repository.seasons()? {
            if !on_disk.contains(season.filepath.as_str()) {
                info!("Deleting removed season: {}", season.name);
                self.delete_season(season.id)?;
                report.seasons_removed.push(season.filepath);
            }
        }

        for entry in root_list.iter().filter(|a| a.is_dir()) {
            if self.repository.season_by_path(&entry.full_path)?.is_some() {
                continue;
            }
            let Some(thumbnail) = self.season_thumbnail(&entry.full_path) else {
                debug!("Skipping {}: no playable media", entry.full_path);
                report.seasons_skipped.push(entry.full_path.clone());
                continue;
            };

            info!("Found new season: {}", entry.name);
            self.repository.create_season(SeasonEntry {
                id: 0,
                filepath: entry.full_path.clone(),
                name: entry.name.clone(),
                thumbnail,
                added: Utc::now(),
            })?;
            report.seasons_added.push(entry.full_path.clone());
        }

        for season in self.repository.seasons()? {
            let episodes = match self.session.enumerate_directory(&season.filepath) {
                Ok(list) => list,
                Err(e) => {
                    warn!("Failed to list season {}: {}", season.name, e);
                    continue;
                }
            };
            let listed: HashSet<&str> = episodes
                .iter()
                .filter(|a| a.is_file())
                .map(|a| a.full_path.as_str())
                .collect();
            for stored in self.repository.episodes_in_season(season.id)? {
                if !listed.contains(stored.filepath.as_str()) {
                    info!("Deleting removed episode: {}", stored.name);
                    self.delete_episode(stored.id)?;
                    report.episodes_removed.push(stored.filepath);
                }
            }

            for episode in episodes.iter().filter(|a| a.is_file()) {
                if self.repository.episode_by_path(&episode.full_path)?.is_some() {
                    continue;
                }
                info!("Found new episode for {}: {}", season.name, episode.name);
                self.repository.create_episode(EpisodeEntry {
                    id: 0,
                    season_id: season.id,
                    filepath: episode.full_path.clone(),
                    name: episode.name.clone(),
                    watched: false,
                    offset_ms: 0,
                    audio_track: TRACK_UNSET,
                    subtitle_track: TRACK_UNSET,
                    added: Utc::now(),
                })?;
                report.episodes_added.push(episode.full_path.clone());
            }
        }

        info!(
            "Finished library sync: {} seasons added, {} removed, {} episodes added, {} removed",
            report.seasons_added.len(),
            report.seasons_removed.len(),
            report.episodes_added.len(),
            report.episodes_removed.len()
        );
        Ok(report)
    }

    /// Cover image for a season directory
    ///
    /// `None` when the directory holds no playable file. A thumbnail that
    /// fails to generate yields an empty image.
    fn season_thumbnail(&self, season_path: &str) -> Option<Vec<u8>> {
        let media = match self.session.enumerate_directory(season_path) {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to list {}: {}", season_path, e);
                return None;
            }
        };
        let cover = media.iter().find(|a| is_media_file(a))?;

        let thumbnail = self
            .session
            .open(&cover.full_path)
            .and_then(|handle| {
                let mut stream = SftpStream::new(handle);
                self.thumbnailer.generate(&mut stream)
            });
        match thumbnail {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to generate thumbnail from {}: {}", cover.full_path, e);
                Some(Vec::new())
            }
        }
    }

    /// Remove one episode and its watch history
    pub fn delete_episode(&mut self, episode_id: i64) -> LibraryResult<()> {
        for entry in self.repository.watch_history()? {
            if entry.episode_id == episode_id {
                self.repository.delete_watch_entry(entry.id)?;
            }
        }
        self.repository.delete_episode(episode_id)?;
        Ok(())
    }

    /// Remove a season with its episodes and their watch history
    pub fn delete_season(&mut self, season_id: i64) -> LibraryResult<()> {
        let episodes = self.repository.episodes_in_season(season_id)?;
        let episode_ids: HashSet<i64> = episodes.iter().map(|e| e.id).collect();

        for entry in self.repository.watch_history()? {
            if episode_ids.contains(&entry.episode_id) {
                self.repository.delete_watch_entry(entry.id)?;
            }
        }
        for episode in &episodes {
            self.repository.delete_episode(episode.id)?;
        }
        self.repository.delete_season(season_id)?;
        Ok(())
    }

    /// Mark an episode watched and record it in the history
    pub fn add_to_watched(&mut self, episode_id: i64) -> LibraryResult<WatchHistoryEntry> {
        let mut episode = self.load_episode(episode_id)?;
        episode.watched = true;
        self.repository.update_episode(&episode)?;

        let mut entry = WatchHistoryEntry {
            id: 0,
            episode_id,
            watched_at: Utc::now(),
        };
        entry.id = self.repository.create_watch_entry(entry.clone())?;
        Ok(entry)
    }

    pub fn mark_unwatched(&mut self, episode_id: i64) -> LibraryResult<()> {
        let mut episode = self.load_episode(episode_id)?;
        info!("Marked {} as unwatched", episode.name);
        episode.watched = false;
        self.repository.update_episode(&episode)?;
        Ok(())
    }

    /// Persist where a playback session ended
    ///
    /// Playing to the end marks the episode watched and rewinds the resume
    /// offset to the start.
    pub fn record_session(&mut self, summary: &SessionSummary) -> LibraryResult<EpisodeEntry> {
        let mut episode = self.load_episode(summary.episode_id)?;
        episode.audio_track = summary.audio_track;
        episode.subtitle_track = summary.subtitle_track;
        if summary.reason == StopReason::EndOfMedia {
            episode.watched = true;
            episode.offset_ms = 0;
        } else {
            episode.offset_ms = summary.offset_ms;
        }
        self.repository.update_episode(&episode)?;
        debug!(
            "Saved {} at {} ms (tracks {}/{})",
            episode.name, episode.offset_ms, episode.audio_track, episode.subtitle_track
        );
        Ok(episode)
    }

    pub fn season_of(&self, episode_id: i64) -> LibraryResult<SeasonEntry> {
        let episode = self.load_episode(episode_id)?;
        self.repository
            .season(episode.season_id)?
            .ok_or(LibraryError::Repository(RepositoryError::NotFound {
                kind: "season",
                id: episode.season_id,
            }))
    }

    /// Seasons ordered by their newest season or episode addition
    pub fn recently_added(&self, limit: usize) -> LibraryResult<Vec<SeasonEntry>> {
        let mut latest: BTreeMap<i64, DateTime<Utc>> = BTreeMap::new();
        for season in self.repository.seasons()? {
            let mut newest = season.added;
            for episode in self.repository.episodes_in_season(season.id)? {
                newest = newest.max(episode.added);
            }
            latest.insert(season.id, newest);
        }
        self.seasons_by_recency(latest, limit)
    }

    /// Seasons ordered by their most recently watched episode
    pub fn recently_watched(&self, limit: usize) -> LibraryResult<Vec<SeasonEntry>> {
        let mut latest: BTreeMap<i64, DateTime<Utc>> = BTreeMap::new();
        for entry in self.repository.watch_history()? {
            let Some(episode) = self.repository.episode(entry.episode_id)? else {
                continue;
            };
            let slot = latest.entry(episode.season_id).or_insert(entry.watched_at);
            *slot = (*slot).max(entry.watched_at);
        }
        self.seasons_by_recency(latest, limit)
    }

    fn seasons_by_recency(
        &self,
        latest: BTreeMap<i64, DateTime<Utc>>,
        limit: usize,
    ) -> LibraryResult<Vec<SeasonEntry>> {
        let mut ordered: Vec<_> = latest.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut seasons = Vec::new();
        for (id, _) in ordered.into_iter().take(limit) {
            if let Some(season) = self.repository.season(id)? {
                seasons.push(season);
            }
        }
        Ok(seasons)
    }

    fn load_episode(&self, episode_id: i64) -> LibraryResult<EpisodeEntry> {
        self.repository
            .episode(episode_id)?
            .ok_or(LibraryError::Repository(RepositoryError::NotFound {
                kind: "episode",
                id: episode_id,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FileType, RemoteStat};

    fn attrs(name: &str, file_type: FileType) -> RemoteAttributes {
        RemoteAttributes::from_listing(
            "/lib",
            name.to_string(),
            RemoteStat {
                size: 1,
                file_type,
            },
        )
    }

    #[test]
    fn test_media_file_detection() {
        assert!(is_media_file(&attrs("ep1.mkv", FileType::Regular)));
        assert!(is_media_file(&attrs("EP2.MP4", FileType::Regular)));
        assert!(!is_media_file(&attrs("notes.txt", FileType::Regular)));
        assert!(!is_media_file(&attrs("mkv", FileType::Regular)));
        assert!(!is_media_file(&attrs("dir.mkv", FileType::Directory)));
    }

    #[test]
    fn test_memory_repository_assigns_ids_and_rejects_duplicates() {
        let mut repo = MemoryRepository::new();
        let season = SeasonEntry {
            id: 99,
            filepath: "/lib/S1".into(),
            name: "S1".into(),
            thumbnail: Vec::new(),
            added: Utc::now(),
        };
        let id = repo.create_season(season.clone()).unwrap();
        assert_eq!(id, 1);
        assert!(matches!(
            repo.create_season(season),
            Err(RepositoryError::Duplicate { .. })
        ));
        assert!(repo.delete_season(42).is_err());
    }

    #[test]
    fn test_episode_requires_existing_season() {
        let mut repo = MemoryRepository::new();
        let err = repo
            .create_episode(EpisodeEntry {
                id: 0,
                season_id: 5,
                filepath: "/lib/S1/e1.mkv".into(),
                name: "e1.mkv".into(),
                watched: false,
                offset_ms: 0,
                audio_track: TRACK_UNSET,
                subtitle_track: TRACK_UNSET,
                added: Utc::now(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "no season with id 5");
    }

    #[test]
    fn test_watch_history_is_newest_first() {
        let mut repo = MemoryRepository::new();
        let earlier = Utc::now() - chrono::Duration::hours(1);
        repo.create_watch_entry(WatchHistoryEntry {
            id: 0,
            episode_id: 1,
            watched_at: earlier,
        })
        .unwrap();
        repo.create_watch_entry(WatchHistoryEntry {
            id: 0,
            episode_id: 2,
            watched_at: Utc::now(),
        })
        .unwrap();

        let history = repo.watch_history().unwrap();
        assert_eq!(history[0].episode_id, 2);
        assert_eq!(history[1].episode_id, 1);
    }
}
