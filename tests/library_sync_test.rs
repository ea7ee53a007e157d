//! Library sync and persistence tests against an in-memory remote tree

use chrono::{TimeZone, Utc};
use sftp_streamer::error::{Result, StreamerError};
use sftp_streamer::library::{
    EpisodeEntry, Library, LibraryError, LibraryRepository, MemoryRepository, SeasonEntry,
    Thumbnailer, WatchHistoryEntry,
};
use sftp_streamer::player::{SessionSummary, StopReason, TRACK_UNSET};
use sftp_streamer::remote::{MemoryChannel, TransportSession};
use sftp_streamer::stream::SeekableStream;
use std::sync::Arc;

fn library_tree() -> MemoryChannel {
    let channel = MemoryChannel::new();
    channel.add_dir("/lib");
    channel.add_file("/lib/readme.txt", b"not a season");

    channel.add_dir("/lib/Show A");
    channel.add_file("/lib/Show A/ep1.mkv", b"MKV1-episode-one");
    channel.add_file("/lib/Show A/ep2.mp4", b"MP42-episode-two");
    channel.add_file("/lib/Show A/notes.txt", b"notes");

    channel.add_dir("/lib/Show B");
    channel.add_file("/lib/Show B/cover.jpg", b"jpeg");

    channel.add_dir("/lib/Show C");
    channel.add_file("/lib/Show C/EP1.MKV", b"UPPER-case");
    channel
}

fn library_for(channel: &MemoryChannel) -> Library<MemoryRepository> {
    let session = Arc::new(TransportSession::new(Arc::new(channel.clone())));
    Library::new("/lib", session, MemoryRepository::new())
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

/// Uses the first four bytes of the stream as the cover
struct HeaderThumbnails;

impl Thumbnailer for HeaderThumbnails {
    fn generate(&self, stream: &mut dyn SeekableStream) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        let n = stream.read(&mut header);
        if n < 0 {
            return Err(StreamerError::Decoder("unreadable header".into()));
        }
        Ok(header[..n as usize].to_vec())
    }
}

struct BrokenThumbnails;

impl Thumbnailer for BrokenThumbnails {
    fn generate(&self, _stream: &mut dyn SeekableStream) -> Result<Vec<u8>> {
        Err(StreamerError::Decoder("no video stream".into()))
    }
}

fn episode_id(library: &Library<MemoryRepository>, path: &str) -> i64 {
    library
        .repository()
        .episode_by_path(path)
        .unwrap()
        .unwrap()
        .id
}

// ============================================================================
// Sync
// ============================================================================

#[test]
fn test_sync_adds_seasons_with_media_and_their_files() {
    let channel = library_tree();
    let mut library = library_for(&channel);

    let report = library.sync().unwrap();
    assert_eq!(
        sorted(report.seasons_added),
        vec!["/lib/Show A", "/lib/Show C"]
    );
    assert_eq!(report.seasons_skipped, vec!["/lib/Show B"]);
    assert!(report.seasons_removed.is_empty());
    assert_eq!(
        sorted(report.episodes_added),
        vec![
            "/lib/Show A/ep1.mkv",
            "/lib/Show A/ep2.mp4",
            "/lib/Show A/notes.txt",
            "/lib/Show C/EP1.MKV",
        ]
    );

    let repository = library.repository();
    assert_eq!(repository.season_count(), 2);
    assert_eq!(repository.episode_count(), 4);

    let episode = repository
        .episode_by_path("/lib/Show A/ep1.mkv")
        .unwrap()
        .unwrap();
    assert_eq!(episode.name, "ep1.mkv");
    assert!(!episode.watched);
    assert_eq!(episode.offset_ms, 0);
    assert_eq!(episode.audio_track, TRACK_UNSET);
    assert_eq!(episode.subtitle_track, TRACK_UNSET);

    let season = repository.season(episode.season_id).unwrap().unwrap();
    assert_eq!(season.name, "Show A");
    assert_eq!(channel.open_file_count(), 0);
    assert_eq!(channel.open_dir_count(), 0);
}

#[test]
fn test_second_sync_only_reports_changes() {
    let channel = library_tree();
    let mut library = library_for(&channel);
    library.sync().unwrap();

    let report = library.sync().unwrap();
    assert!(report.seasons_added.is_empty());
    assert!(report.episodes_added.is_empty());
    assert_eq!(report.seasons_skipped, vec!["/lib/Show B"]);

    channel.add_file("/lib/Show C/EP2.MKV", b"second");
    let report = library.sync().unwrap();
    assert_eq!(report.episodes_added, vec!["/lib/Show C/EP2.MKV"]);
    assert_eq!(library.repository().episode_count(), 5);
}

#[test]
fn test_sync_removes_vanished_season_with_history() {
    let channel = library_tree();
    let mut library = library_for(&channel);
    library.sync().unwrap();

    let gone = episode_id(&library, "/lib/Show A/ep1.mkv");
    let kept = episode_id(&library, "/lib/Show C/EP1.MKV");
    library.add_to_watched(gone).unwrap();
    library.add_to_watched(kept).unwrap();

    channel.remove("/lib/Show A");
    let report = library.sync().unwrap();
    assert_eq!(report.seasons_removed, vec!["/lib/Show A"]);

    let repository = library.repository();
    assert_eq!(repository.season_count(), 1);
    assert_eq!(repository.episode_count(), 1);
    assert!(repository.episode(gone).unwrap().is_none());

    let history = repository.watch_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].episode_id, kept);
}

#[test]
fn test_sync_prunes_vanished_episode_with_history() {
    let channel = library_tree();
    let mut library = library_for(&channel);
    library.sync().unwrap();

    let gone = episode_id(&library, "/lib/Show A/ep2.mp4");
    let kept = episode_id(&library, "/lib/Show A/ep1.mkv");
    library.add_to_watched(gone).unwrap();
    library.add_to_watched(kept).unwrap();

    channel.remove("/lib/Show A/ep2.mp4");
    let report = library.sync().unwrap();
    assert_eq!(report.episodes_removed, vec!["/lib/Show A/ep2.mp4"]);
    assert!(report.seasons_removed.is_empty());
    assert!(report.episodes_added.is_empty());

    let repository = library.repository();
    assert_eq!(repository.season_count(), 2);
    assert_eq!(repository.episode_count(), 3);
    assert!(repository
        .episode_by_path("/lib/Show A/ep2.mp4")
        .unwrap()
        .is_none());
    assert!(repository.episode(kept).unwrap().is_some());

    let history = repository.watch_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].episode_id, kept);

    // Nothing else changed on the server
    assert!(library.sync().unwrap().episodes_removed.is_empty());
}

#[test]
fn test_unlistable_root_aborts_sync() {
    let channel = library_tree();
    let session = Arc::new(TransportSession::new(Arc::new(channel.clone())));
    let mut library = Library::new("/missing", session, MemoryRepository::new());

    let err = library.sync().unwrap_err();
    assert!(matches!(
        err,
        LibraryError::Remote(StreamerError::RemoteIo { .. })
    ));
    assert_eq!(library.repository().season_count(), 0);
}

#[test]
fn test_unlistable_season_is_skipped_for_episodes() {
    let channel = MemoryChannel::new();
    channel.add_dir("/lib");
    channel.add_dir("/lib/A");
    channel.add_file("/lib/A/a1.mkv", b"a1");
    channel.add_dir("/lib/B");
    channel.add_file("/lib/B/b1.mkv", b"b1");
    let mut library = library_for(&channel);
    library.sync().unwrap();

    for i in 2..7 {
        channel.add_file(format!("/lib/A/a{}.mkv", i), b"more");
    }
    channel.add_file("/lib/B/b2.mkv", b"b2");
    // Root and B stay under the limit, A does not
    channel.truncate_listings_after(5);

    let report = library.sync().unwrap();
    assert_eq!(report.episodes_added, vec!["/lib/B/b2.mkv"]);
    assert!(report.seasons_removed.is_empty());
    assert_eq!(library.repository().season_count(), 2);
    assert_eq!(channel.open_dir_count(), 0);
}

#[test]
fn test_thumbnails_come_from_first_media_file() {
    let channel = library_tree();
    let session = Arc::new(TransportSession::new(Arc::new(channel.clone())));
    let mut library =
        Library::new("/lib", session, MemoryRepository::new()).with_thumbnailer(HeaderThumbnails);
    library.sync().unwrap();

    let season = library
        .repository()
        .season_by_path("/lib/Show A")
        .unwrap()
        .unwrap();
    assert_eq!(season.thumbnail, b"MKV1");
    assert_eq!(channel.open_file_count(), 0);
}

#[test]
fn test_failed_thumbnail_still_adds_season() {
    let channel = library_tree();
    let session = Arc::new(TransportSession::new(Arc::new(channel.clone())));
    let mut library =
        Library::new("/lib", session, MemoryRepository::new()).with_thumbnailer(BrokenThumbnails);

    let report = library.sync().unwrap();
    assert_eq!(report.seasons_added.len(), 2);
    let season = library
        .repository()
        .season_by_path("/lib/Show C")
        .unwrap()
        .unwrap();
    assert!(season.thumbnail.is_empty());
}

// ============================================================================
// Watch state
// ============================================================================

fn summary(episode_id: i64, offset_ms: u64, reason: StopReason) -> SessionSummary {
    SessionSummary {
        episode_id,
        path: String::new(),
        offset_ms,
        duration_ms: Some(1_200_000),
        audio_track: 2,
        subtitle_track: 5,
        reason,
        bytes_read: 0,
    }
}

#[test]
fn test_record_session_saves_resume_point_and_tracks() {
    let channel = library_tree();
    let mut library = library_for(&channel);
    library.sync().unwrap();
    let id = episode_id(&library, "/lib/Show A/ep2.mp4");

    let saved = library
        .record_session(&summary(id, 421_000, StopReason::User))
        .unwrap();
    assert_eq!(saved.offset_ms, 421_000);
    assert_eq!((saved.audio_track, saved.subtitle_track), (2, 5));
    assert!(!saved.watched);

    let saved = library
        .record_session(&summary(id, 1_199_000, StopReason::EndOfMedia))
        .unwrap();
    assert!(saved.watched);
    assert_eq!(saved.offset_ms, 0);
    assert_eq!(saved.audio_track, 2);

    let stored = library.repository().episode(id).unwrap().unwrap();
    assert_eq!(stored, saved);
}

#[test]
fn test_record_session_for_unknown_episode() {
    let channel = library_tree();
    let mut library = library_for(&channel);

    let err = library
        .record_session(&summary(99, 0, StopReason::User))
        .unwrap_err();
    assert_eq!(err.to_string(), "no episode with id 99");
}

#[test]
fn test_watched_toggle_and_season_lookup() {
    let channel = library_tree();
    let mut library = library_for(&channel);
    library.sync().unwrap();
    let id = episode_id(&library, "/lib/Show C/EP1.MKV");

    let entry = library.add_to_watched(id).unwrap();
    assert_eq!(entry.episode_id, id);
    assert!(library.repository().episode(id).unwrap().unwrap().watched);

    library.mark_unwatched(id).unwrap();
    assert!(!library.repository().episode(id).unwrap().unwrap().watched);
    // History is kept when an episode is marked unwatched
    assert_eq!(library.repository().watch_history().unwrap().len(), 1);

    assert_eq!(library.season_of(id).unwrap().name, "Show C");
}

// ============================================================================
// Recency views
// ============================================================================

fn seeded_repository() -> (MemoryRepository, i64, i64, i64, i64) {
    let mut repository = MemoryRepository::new();
    let at = |month: u32| Utc.with_ymd_and_hms(2024, month, 1, 12, 0, 0).unwrap();

    let season = |repository: &mut MemoryRepository, name: &str, month: u32| {
        repository
            .create_season(SeasonEntry {
                id: 0,
                filepath: format!("/lib/{}", name),
                name: name.to_string(),
                thumbnail: Vec::new(),
                added: at(month),
            })
            .unwrap()
    };
    let old = season(&mut repository, "Old", 1);
    let new = season(&mut repository, "New", 6);

    let episode = |repository: &mut MemoryRepository, season_id: i64, name: &str, month: u32| {
        repository
            .create_episode(EpisodeEntry {
                id: 0,
                season_id,
                filepath: format!("/lib/{}", name),
                name: name.to_string(),
                watched: false,
                offset_ms: 0,
                audio_track: TRACK_UNSET,
                subtitle_track: TRACK_UNSET,
                added: at(month),
            })
            .unwrap()
    };
    // A fresh episode makes the old season the most recently added
    let old_ep = episode(&mut repository, old, "Old/e1.mkv", 9);
    let new_ep = episode(&mut repository, new, "New/e1.mkv", 6);
    (repository, old, new, old_ep, new_ep)
}

#[test]
fn test_recently_added_uses_newest_episode() {
    let (repository, old, new, _, _) = seeded_repository();
    let session = Arc::new(TransportSession::new(Arc::new(MemoryChannel::new())));
    let library = Library::new("/lib", session, repository);

    let ids: Vec<i64> = library
        .recently_added(10)
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec![old, new]);
    assert_eq!(library.recently_added(1).unwrap().len(), 1);
}

#[test]
fn test_recently_watched_orders_by_last_view() {
    let (mut repository, old, new, old_ep, new_ep) = seeded_repository();
    let watched = |episode_id: i64, day: u32| WatchHistoryEntry {
        id: 0,
        episode_id,
        watched_at: Utc.with_ymd_and_hms(2024, 10, day, 20, 0, 0).unwrap(),
    };
    repository.create_watch_entry(watched(old_ep, 1)).unwrap();
    repository.create_watch_entry(watched(new_ep, 5)).unwrap();
    repository.create_watch_entry(watched(old_ep, 3)).unwrap();

    let session = Arc::new(TransportSession::new(Arc::new(MemoryChannel::new())));
    let library = Library::new("/lib", session, repository);

    let ids: Vec<i64> = library
        .recently_watched(10)
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec![new, old]);
}
