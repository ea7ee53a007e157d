//! Streaming session controller
//!
//! Owns the lifecycle of one playback: the remote file handle, the seekable
//! stream adapter wrapping it, the callback context handed to the decoder and
//! the decoder itself.
//!
//! ```text
//! Idle -> Opening -> Playing <-> Paused -> Stopped -> Idle
//! ```
//!
//! Teardown always releases the decoder first, then the adapter, then the
//! handle. The decoder may still be calling back into the adapter from its
//! own worker threads until `Decoder::stop` returns.

pub mod events;
pub mod tracks;

pub use events::{PlaybackEvent, PlaybackPublisher, PlaybackSubscriber};
pub use tracks::{TrackDescription, TrackKind, TrackRotation, TRACK_UNSET};

use crate::config::PlaybackConfig;
use crate::error::{Result, StreamerError};
use crate::remote::TransportSession;
use crate::stream::{CallbackContext, CallbackStats, MediaSource, SftpStream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The external media decoder
///
/// Implementations pull bytes through the [`MediaSource`] callbacks on their
/// own threads. `stop` must not return until those threads no longer call
/// into the source.
pub trait Decoder: Send {
    /// Bind to a media source and begin asynchronous startup
    fn start(&mut self, media: MediaSource) -> Result<()>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Jump to `ms` milliseconds from the start
    fn set_time(&mut self, ms: u64);

    /// Current playback position in milliseconds, if known
    fn time(&self) -> Option<u64>;

    /// Media length in milliseconds, if known
    fn duration(&self) -> Option<u64>;

    fn state(&self) -> DecoderState;

    fn audio_tracks(&self) -> Vec<TrackDescription>;

    fn subtitle_tracks(&self) -> Vec<TrackDescription>;

    fn audio_track(&self) -> i32;

    fn subtitle_track(&self) -> i32;

    fn set_audio_track(&mut self, id: i32);

    fn set_subtitle_track(&mut self, id: i32);

    /// Overlay a short message on the video
    fn show_message(&mut self, _text: &str) {}

    /// Stop playback and wait for every worker thread to finish
    fn stop(&mut self);
}

/// Creates a fresh decoder for each session
pub type DecoderFactory = Box<dyn FnMut() -> Result<Box<dyn Decoder>> + Send>;

/// State reported by the decoder itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Opening,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Ended,
    Error,
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Opening,
    Playing,
    Paused,
    Stopped,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Opening => "opening",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
        }
    }

    /// A session exists in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackState::Opening | PlaybackState::Playing | PlaybackState::Paused
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Explicit user stop
    User,
    /// Window or application teardown
    Teardown,
    /// Decoder reached the end of the media
    EndOfMedia,
    /// Another episode was started
    Replaced,
    /// Decoder entered its error state
    DecoderError,
}

/// An episode the user asked to play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRequest {
    pub id: i64,
    pub path: String,
    /// Position to restore once playback starts (0 = from the beginning)
    pub resume_offset_ms: u64,
    pub audio_track: i32,
    pub subtitle_track: i32,
}

impl EpisodeRequest {
    pub fn new(id: i64, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            resume_offset_ms: 0,
            audio_track: TRACK_UNSET,
            subtitle_track: TRACK_UNSET,
        }
    }

    pub fn with_resume_offset(mut self, ms: u64) -> Self {
        self.resume_offset_ms = ms;
        self
    }

    pub fn with_tracks(mut self, audio_track: i32, subtitle_track: i32) -> Self {
        self.audio_track = audio_track;
        self.subtitle_track = subtitle_track;
        self
    }
}

/// Passive position snapshot for UI feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackProgress {
    pub episode_id: i64,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
}

impl PlaybackProgress {
    /// Fraction of the media played, when the duration is known
    pub fn fraction(&self) -> Option<f64> {
        match self.duration_ms {
            Some(d) if d > 0 => Some((self.position_ms as f64 / d as f64).min(1.0)),
            _ => None,
        }
    }
}

/// What a finished session leaves behind for persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub episode_id: i64,
    pub path: String,
    pub offset_ms: u64,
    pub duration_ms: Option<u64>,
    pub audio_track: i32,
    pub subtitle_track: i32,
    pub reason: StopReason,
    pub bytes_read: u64,
}

struct ActiveSession {
    request: EpisodeRequest,
    decoder: Option<Box<dyn Decoder>>,
    // Boxed so the opaque pointer given to the decoder stays valid.
    context: Box<CallbackContext>,
    audio: TrackRotation,
    subtitles: TrackRotation,
}

impl ActiveSession {
    fn decoder(&self) -> Result<&dyn Decoder> {
        self.decoder
            .as_deref()
            .ok_or_else(|| StreamerError::Decoder("decoder already released".to_string()))
    }

    fn decoder_mut(&mut self) -> Result<&mut (dyn Decoder + 'static)> {
        self.decoder
            .as_deref_mut()
            .ok_or_else(|| StreamerError::Decoder("decoder already released".to_string()))
    }
}

/// Drives one playback session at a time
///
/// Not thread-safe by itself: the UI thread owns the controller and calls it
/// in response to user intents and a periodic tick.
pub struct StreamingController {
    session: Arc<TransportSession>,
    factory: DecoderFactory,
    config: PlaybackConfig,
    publisher: PlaybackPublisher,
    state: PlaybackState,
    active: Option<ActiveSession>,
}

impl StreamingController {
    pub fn new<F>(session: Arc<TransportSession>, factory: F, config: PlaybackConfig) -> Self
    where
        F: FnMut() -> Result<Box<dyn Decoder>> + Send + 'static,
    {
        Self {
            session,
            factory: Box::new(factory),
            config,
            publisher: PlaybackPublisher::noop(),
            state: PlaybackState::Idle,
            active: None,
        }
    }

    /// Start receiving events; replaces any previous subscriber
    pub fn subscribe(&mut self) -> PlaybackSubscriber {
        let (publisher, subscriber) = PlaybackPublisher::unbounded();
        self.publisher = publisher;
        subscriber
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_episode(&self) -> Option<&EpisodeRequest> {
        self.active.as_ref().map(|a| &a.request)
    }

    /// Calls the decoder has made into the current stream
    pub fn callback_stats(&self) -> Option<CallbackStats> {
        self.active.as_ref().map(|a| a.context.stats())
    }

    fn transition(&mut self, to: PlaybackState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("Playback {} -> {}", from, to);
        self.publisher
            .publish(PlaybackEvent::StateChanged { from, to });
    }

    fn invalid(&self, action: &'static str) -> StreamerError {
        StreamerError::InvalidState {
            state: self.state.as_str(),
            action,
        }
    }

    fn open_failed(&self, path: &str, source: StreamerError) -> StreamerError {
        warn!("Failed to open {} for playback: {}", path, source);
        self.publisher.publish(PlaybackEvent::OpenFailed {
            path: path.to_string(),
            message: source.to_string(),
        });
        StreamerError::PlaybackOpen {
            path: path.to_string(),
            source: Box::new(source),
        }
    }

    /// Open `request.path` and hand it to a new decoder
    ///
    /// The controller enters `Opening` before the remote open. An active
    /// session keeps playing until the new file has been opened, so a path
    /// that vanished since the last sync leaves it untouched. If the decoder
    /// then refuses the stream the controller falls back to `Idle`. Every
    /// failure publishes `OpenFailed` and leaves nothing open.
    pub fn play_episode(&mut self, request: EpisodeRequest) -> Result<()> {
        info!("Playing {}", request.path);
        let handle = if self.state.is_active() {
            let handle = self
                .session
                .open(&request.path)
                .map_err(|e| self.open_failed(&request.path, e))?;
            self.stop(StopReason::Replaced);
            self.transition(PlaybackState::Opening);
            handle
        } else {
            self.transition(PlaybackState::Opening);
            match self.session.open(&request.path) {
                Ok(handle) => handle,
                Err(e) => return Err(self.abort_open(&request.path, e)),
            }
        };

        let mut decoder = match (self.factory)() {
            Ok(decoder) => decoder,
            Err(e) => return Err(self.abort_open(&request.path, e)),
        };

        let context = Box::new(CallbackContext::new(Box::new(SftpStream::new(handle))));
        let media = MediaSource::new(&context, self.config.decoder_options.clone());

        if let Err(e) = decoder.start(media) {
            decoder.stop();
            drop(decoder);
            drop(context.detach(self.config.stop_timeout()));
            return Err(self.abort_open(&request.path, e));
        }

        self.active = Some(ActiveSession {
            request,
            decoder: Some(decoder),
            context,
            audio: TrackRotation::new(),
            subtitles: TrackRotation::new(),
        });
        Ok(())
    }

    fn abort_open(&mut self, path: &str, source: StreamerError) -> StreamerError {
        self.transition(PlaybackState::Idle);
        self.open_failed(path, source)
    }

    /// The decoder acknowledged playback start
    ///
    /// Restores the remembered offset and track selection.
    pub fn on_decoder_started(&mut self) -> Result<()> {
        if self.state != PlaybackState::Opening {
            return Err(self.invalid("start playback"));
        }
        let active = self.active.as_mut().ok_or_else(|| StreamerError::InvalidState {
            state: PlaybackState::Opening.as_str(),
            action: "start playback",
        })?;

        let request = active.request.clone();
        let decoder = active.decoder_mut()?;
        if request.resume_offset_ms > 0 {
            debug!("Resuming at {} ms", request.resume_offset_ms);
            decoder.set_time(request.resume_offset_ms);
        }
        if request.audio_track != TRACK_UNSET {
            decoder.set_audio_track(request.audio_track);
        }
        if request.subtitle_track != TRACK_UNSET {
            decoder.set_subtitle_track(request.subtitle_track);
        }
        active.audio.reset();
        active.subtitles.reset();

        self.transition(PlaybackState::Playing);
        Ok(())
    }

    /// Playing <-> Paused; the stream stays open
    pub fn toggle_pause(&mut self) -> Result<PlaybackState> {
        let next = match self.state {
            PlaybackState::Playing => PlaybackState::Paused,
            PlaybackState::Paused => PlaybackState::Playing,
            _ => return Err(self.invalid("toggle pause")),
        };
        let Some(active) = self.active.as_mut() else {
            return Err(self.invalid("toggle pause"));
        };
        let decoder = active.decoder_mut()?;
        match next {
            PlaybackState::Paused => decoder.pause(),
            _ => decoder.play(),
        }
        self.transition(next);
        Ok(next)
    }

    /// Jump to `ms`, clamped to the media duration when it is known
    pub fn seek_to(&mut self, ms: u64) -> Result<u64> {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            return Err(self.invalid("seek"));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(self.invalid("seek"));
        };
        let decoder = active.decoder_mut()?;
        let target = match decoder.duration() {
            Some(duration) => ms.min(duration),
            None => ms,
        };
        debug!("Seeking to {} ms", target);
        decoder.set_time(target);
        Ok(target)
    }

    pub fn rotate_audio_track(&mut self) -> Result<Option<TrackDescription>> {
        self.rotate_track(TrackKind::Audio)
    }

    pub fn rotate_subtitle_track(&mut self) -> Result<Option<TrackDescription>> {
        self.rotate_track(TrackKind::Subtitle)
    }

    fn rotate_track(&mut self, kind: TrackKind) -> Result<Option<TrackDescription>> {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            return Err(self.invalid("change track"));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(self.invalid("change track"));
        };
        let ActiveSession {
            decoder,
            audio,
            subtitles,
            ..
        } = active;
        let Some(decoder) = decoder.as_deref_mut() else {
            return Err(StreamerError::Decoder("decoder already released".to_string()));
        };

        let selected = match kind {
            TrackKind::Audio => audio
                .next(|| decoder.audio_tracks(), decoder.audio_track())
                .cloned(),
            TrackKind::Subtitle => subtitles
                .next(|| decoder.subtitle_tracks(), decoder.subtitle_track())
                .cloned(),
        };
        let Some(track) = selected else {
            debug!("No {} tracks to rotate through", kind);
            return Ok(None);
        };

        match kind {
            TrackKind::Audio => decoder.set_audio_track(track.id),
            TrackKind::Subtitle => decoder.set_subtitle_track(track.id),
        }
        let message = kind.announce(&track);
        info!("{}", message);
        decoder.show_message(&message);

        self.publisher.publish(PlaybackEvent::TrackChanged {
            kind,
            track: track.clone(),
        });
        Ok(Some(track))
    }

    /// Periodic poll of decoder position
    ///
    /// Also follows decoder-side transitions: a decoder that reports it is
    /// playing completes `Opening`, and end of media or a decoder error stops
    /// the session.
    pub fn tick(&mut self) -> Option<PlaybackProgress> {
        let decoder_state = self.active.as_ref()?.decoder().ok()?.state();

        match (self.state, decoder_state) {
            (PlaybackState::Opening, DecoderState::Playing) => {
                if let Err(e) = self.on_decoder_started() {
                    warn!("Failed to complete playback start: {}", e);
                }
            }
            (_, DecoderState::Ended) => {
                self.stop(StopReason::EndOfMedia);
                return None;
            }
            (_, DecoderState::Error) => {
                warn!("Decoder reported an error, stopping playback");
                self.stop(StopReason::DecoderError);
                return None;
            }
            _ => {}
        }

        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            return None;
        }

        let active = self.active.as_ref()?;
        let decoder = active.decoder().ok()?;
        let progress = PlaybackProgress {
            episode_id: active.request.id,
            position_ms: decoder.time().unwrap_or(0),
            duration_ms: decoder.duration(),
        };
        self.publisher
            .publish(PlaybackEvent::Progress(progress.clone()));
        Some(progress)
    }

    /// Tear down the active session
    ///
    /// Captures the final offset and track selection, then releases the
    /// decoder (waiting for its threads), the adapter and the handle, in that
    /// order. Returns `None` when nothing was playing.
    pub fn stop(&mut self, reason: StopReason) -> Option<SessionSummary> {
        let mut active = self.active.take()?;

        let started = matches!(self.state, PlaybackState::Playing | PlaybackState::Paused);
        let (offset_ms, duration_ms, audio_track, subtitle_track) =
            match (started, active.decoder.as_deref()) {
                (true, Some(decoder)) => (
                    decoder.time().unwrap_or(0),
                    decoder.duration(),
                    decoder.audio_track(),
                    decoder.subtitle_track(),
                ),
                _ => (
                    active.request.resume_offset_ms,
                    None,
                    active.request.audio_track,
                    active.request.subtitle_track,
                ),
            };

        if let Some(mut decoder) = active.decoder.take() {
            decoder.stop();
            drop(decoder);
        }
        let stream = active.context.detach(self.config.stop_timeout());
        let stats = active.context.stats();
        drop(stream);
        drop(active.context);

        let summary = SessionSummary {
            episode_id: active.request.id,
            path: active.request.path,
            offset_ms,
            duration_ms,
            audio_track,
            subtitle_track,
            reason,
            bytes_read: stats.bytes_read,
        };
        info!(
            "Stopped {} at {} ms ({:?}, {} bytes streamed)",
            summary.path, summary.offset_ms, reason, summary.bytes_read
        );

        self.transition(PlaybackState::Stopped);
        self.publisher
            .publish(PlaybackEvent::Stopped(summary.clone()));
        self.transition(PlaybackState::Idle);
        Some(summary)
    }
}

impl Drop for StreamingController {
    fn drop(&mut self) {
        self.stop(StopReason::Teardown);
    }
}

impl fmt::Debug for StreamingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingController")
            .field("state", &self.state)
            .field("episode", &self.current_episode().map(|r| r.path.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_request_defaults_to_unset_tracks() {
        let request = EpisodeRequest::new(7, "/lib/s1/e1.mkv");
        assert_eq!(request.audio_track, TRACK_UNSET);
        assert_eq!(request.subtitle_track, TRACK_UNSET);
        assert_eq!(request.resume_offset_ms, 0);

        let request = request.with_resume_offset(1500).with_tracks(1, 3);
        assert_eq!(request.resume_offset_ms, 1500);
        assert_eq!((request.audio_track, request.subtitle_track), (1, 3));
    }

    #[test]
    fn test_progress_fraction() {
        let progress = PlaybackProgress {
            episode_id: 1,
            position_ms: 250,
            duration_ms: Some(1000),
        };
        assert_eq!(progress.fraction(), Some(0.25));

        let unknown = PlaybackProgress {
            duration_ms: None,
            ..progress.clone()
        };
        assert_eq!(unknown.fraction(), None);

        let zero = PlaybackProgress {
            duration_ms: Some(0),
            ..progress
        };
        assert_eq!(zero.fraction(), None);
    }

    #[test]
    fn test_state_activity() {
        assert!(!PlaybackState::Idle.is_active());
        assert!(PlaybackState::Opening.is_active());
        assert!(PlaybackState::Paused.is_active());
        assert!(!PlaybackState::Stopped.is_active());
        assert_eq!(PlaybackState::Playing.to_string(), "playing");
    }
}
