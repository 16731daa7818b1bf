//! Local and remote media stream handles.
//!
//! A [`MediaStream`] is a cheap, cloneable handle over a set of tracks. The
//! transport reads the tracks' `enabled` flags to decide whether to forward
//! media; the call session is the only writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug)]
struct TrackInner {
    id: u64,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// A single audio or video track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the track. Returns `true` if this call performed the stop.
    pub fn stop(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::AcqRel)
    }
}

/// A bundle of tracks acquired together from the local devices, or
/// received from a remote peer.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: u64,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            tracks,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Snapshot of every track's `enabled` flag, in track order.
    pub fn enabled_flags(&self) -> Vec<bool> {
        self.tracks.iter().map(MediaTrack::is_enabled).collect()
    }

    /// Stop every track. Returns how many tracks were live before the call.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}
