/*!
 * Playback event publisher
 *
 * The controller publishes state transitions, open failures, progress ticks
 * and session summaries; the UI (or a persistence layer) subscribes.
 */

use super::tracks::{TrackDescription, TrackKind};
use super::{PlaybackProgress, PlaybackState, SessionSummary};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Controller moved between states
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },

    /// Playback could not start; the controller stayed in its prior state
    OpenFailed { path: String, message: String },

    /// Periodic position update while a session is active
    Progress(PlaybackProgress),

    /// A different audio or subtitle track was selected
    TrackChanged {
        kind: TrackKind,
        track: TrackDescription,
    },

    /// Session torn down; carries what should be persisted
    Stopped(SessionSummary),
}

/// Sends events to at most one subscriber
#[derive(Clone)]
pub struct PlaybackPublisher {
    sender: Option<Sender<PlaybackEvent>>,
}

impl PlaybackPublisher {
    /// Bounded channel; events are dropped when the subscriber falls behind
    pub fn new(buffer_size: usize) -> (Self, PlaybackSubscriber) {
        let (tx, rx) = bounded(buffer_size);
        (
            PlaybackPublisher { sender: Some(tx) },
            PlaybackSubscriber { receiver: rx },
        )
    }

    pub fn unbounded() -> (Self, PlaybackSubscriber) {
        let (tx, rx) = unbounded();
        (
            PlaybackPublisher { sender: Some(tx) },
            PlaybackSubscriber { receiver: rx },
        )
    }

    /// Publisher that discards everything
    pub fn noop() -> Self {
        PlaybackPublisher { sender: None }
    }

    pub fn publish(&self, event: PlaybackEvent) {
        if let Some(ref tx) = self.sender {
            let _ = tx.try_send(event);
        }
    }
}

impl Default for PlaybackPublisher {
    fn default() -> Self {
        Self::noop()
    }
}

pub struct PlaybackSubscriber {
    receiver: Receiver<PlaybackEvent>,
}

impl PlaybackSubscriber {
    pub fn try_recv(&self) -> Option<PlaybackEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PlaybackEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Everything published so far, without blocking
    pub fn drain(&self) -> Vec<PlaybackEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn receiver(&self) -> &Receiver<PlaybackEvent> {
        &self.receiver
    }
}
