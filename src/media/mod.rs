//! Local media ownership.
//!
//! The session owns the local track set for its whole lifetime; tracks
//! are attached (not transferred) to both the primary and the recording
//! connection. Enabling or disabling a track mutates shared state seen by
//! every consumer, so it happens once here, never per connection.

pub mod webrtc;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ::webrtc::track::track_local::TrackLocal;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local media track.
///
/// Clones share the enabled flag and the underlying RTP track, so a track
/// handed to two connections stays a single source of truth.
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    /// Concrete RTP track handed to peer connections. Absent in tests.
    pub rtp: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        rtp: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtp,
        }
    }

    /// The single mutation point for the track's enabled flag. The
    /// embedder's capture loop observes this to pause or resume feeding
    /// samples, which pauses the track for every attached connection at
    /// once.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// The local tracks of the running session: audio from the start, video
/// optionally added mid-call.
#[derive(Debug, Clone)]
pub struct LocalMediaSet {
    audio: LocalTrack,
    video: Option<LocalTrack>,
}

impl LocalMediaSet {
    pub fn new(audio: LocalTrack) -> Self {
        Self { audio, video: None }
    }

    pub fn audio(&self) -> &LocalTrack {
        &self.audio
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn set_video(&mut self, track: LocalTrack) {
        self.video = Some(track);
    }

    /// All tracks, audio first. Attachment order to a connection follows
    /// this.
    pub fn tracks(&self) -> Vec<&LocalTrack> {
        let mut tracks = vec![&self.audio];
        if let Some(video) = &self.video {
            tracks.push(video);
        }
        tracks
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio.set_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(video) = &self.video {
            video.set_enabled(enabled);
        }
    }
}

/// Acquires local capture tracks.
///
/// Acquisition is an I/O boundary (device permission, hardware) and can
/// fail; a failed audio acquisition aborts the call before any signaling,
/// a failed video acquisition leaves the call audio-only.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_audio(&self) -> Result<LocalTrack, anyhow::Error>;
    async fn acquire_video(&self) -> Result<LocalTrack, anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_flag_is_shared_between_clones() {
        let track = LocalTrack::new("audio", TrackKind::Audio, None);
        let attached_to_primary = track.clone();
        let attached_to_recording = track.clone();

        track.set_enabled(false);
        assert!(!attached_to_primary.is_enabled());
        assert!(!attached_to_recording.is_enabled());
    }

    #[test]
    fn test_track_set_grows_with_video() {
        let mut media = LocalMediaSet::new(LocalTrack::new("audio", TrackKind::Audio, None));
        assert_eq!(media.tracks().len(), 1);

        media.set_video(LocalTrack::new("video", TrackKind::Video, None));
        let kinds: Vec<_> = media.tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TrackKind::Audio, TrackKind::Video]);
    }
}
