//! Audio and subtitle track rotation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Track id meaning "no remembered selection"
pub const TRACK_UNSET: i32 = -2;

/// One selectable track as reported by the decoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescription {
    pub id: i32,
    pub name: String,
}

impl TrackDescription {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Subtitle,
}

impl TrackKind {
    fn label(self) -> &'static str {
        match self {
            TrackKind::Audio => "Track",
            TrackKind::Subtitle => "Subtitle",
        }
    }

    /// On-screen message announcing a newly selected track
    pub fn announce(self, track: &TrackDescription) -> String {
        format!("{} {}: {}", self.label(), track.id, track.name)
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Cycles through a lazily loaded track list, wrapping at the end
///
/// The list is fetched from the decoder on the first rotation and the cursor
/// starts at the decoder's current track. An explicit track selection made
/// elsewhere invalidates the cursor via [`TrackRotation::reset`].
#[derive(Debug, Default)]
pub struct TrackRotation {
    tracks: Option<Vec<TrackDescription>>,
    current: usize,
}

impl TrackRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.tracks = None;
        self.current = 0;
    }

    /// Advance to the next track
    ///
    /// Returns `None` when the decoder reports no tracks.
    pub fn next(
        &mut self,
        load: impl FnOnce() -> Vec<TrackDescription>,
        current_id: i32,
    ) -> Option<&TrackDescription> {
        if self.tracks.is_none() {
            let tracks = load();
            if tracks.is_empty() {
                return None;
            }
            // Unknown current id: start from the last entry so the first
            // rotation wraps to the head of the list.
            self.current = tracks
                .iter()
                .position(|t| t.id == current_id)
                .unwrap_or(tracks.len() - 1);
            self.tracks = Some(tracks);
        }

        let tracks = self.tracks.as_ref()?;
        self.current = (self.current + 1) % tracks.len();
        tracks.get(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks() -> Vec<TrackDescription> {
        vec![
            TrackDescription::new(-1, "Disable"),
            TrackDescription::new(1, "English"),
            TrackDescription::new(2, "Japanese"),
        ]
    }

    #[test]
    fn test_rotation_starts_after_current_and_wraps() {
        let mut rotation = TrackRotation::new();
        assert_eq!(rotation.next(tracks, 1).unwrap().id, 2);
        assert_eq!(rotation.next(tracks, 2).unwrap().id, -1);
        assert_eq!(rotation.next(tracks, -1).unwrap().id, 1);
    }

    #[test]
    fn test_unknown_current_wraps_to_head() {
        let mut rotation = TrackRotation::new();
        assert_eq!(rotation.next(tracks, 99).unwrap().id, -1);
    }

    #[test]
    fn test_empty_list_yields_nothing() {
        let mut rotation = TrackRotation::new();
        assert!(rotation.next(Vec::new, 0).is_none());
        // retried on the next rotation
        assert!(rotation.next(tracks, 1).is_some());
    }

    #[test]
    fn test_reset_reloads_list() {
        let mut rotation = TrackRotation::new();
        rotation.next(tracks, 1);
        rotation.reset();
        assert_eq!(rotation.next(tracks, -1).unwrap().id, 1);
    }

    #[test]
    fn test_announcement_text() {
        let track = TrackDescription::new(2, "Japanese");
        assert_eq!(TrackKind::Audio.announce(&track), "Track 2: Japanese");
        assert_eq!(TrackKind::Subtitle.announce(&track), "Subtitle 2: Japanese");
    }
}
