use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info, warn};

use carelink_shared::stream::{MediaStream, MediaTrack, TrackKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No {0:?} input device available")]
    NoDevice(TrackKind),

    #[error("Permission denied for {0:?} capture")]
    PermissionDenied(TrackKind),

    #[error("Capture error: {0}")]
    Capture(String),
}

/// Which kinds of tracks to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

/// Local capture devices (camera, microphone).
pub trait MediaDevices: Send + Sync + 'static {
    fn acquire(&self, constraints: MediaConstraints)
        -> BoxFuture<'static, Result<MediaStream, MediaError>>;
}

/// Acquire audio and video, falling back to audio only when the video
/// request fails. The audio-only error is the one reported.
pub async fn acquire_with_fallback(devices: &dyn MediaDevices) -> Result<MediaStream, MediaError> {
    match devices.acquire(MediaConstraints::AUDIO_VIDEO).await {
        Ok(stream) => {
            debug!(tracks = stream.tracks().len(), "Acquired audio and video");
            Ok(stream)
        }
        Err(e) => {
            warn!(error = %e, "Audio/video capture failed, retrying audio only");
            let stream = devices.acquire(MediaConstraints::AUDIO_ONLY).await?;
            info!("Continuing with audio only");
            Ok(stream)
        }
    }
}

/// Device set that fabricates tracks, for headless clients and tests.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    audio: bool,
    video: bool,
    delay: Duration,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            audio: true,
            video: true,
            delay: Duration::ZERO,
        }
    }

    pub fn without_video(mut self) -> Self {
        self.video = false;
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.audio = false;
        self
    }

    /// Simulate a slow permission prompt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDevices for SyntheticDevices {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<MediaStream, MediaError>> {
        let devices = self.clone();
        Box::pin(async move {
            if !devices.delay.is_zero() {
                tokio::time::sleep(devices.delay).await;
            }
            let mut tracks = Vec::new();
            if constraints.audio {
                if !devices.audio {
                    return Err(MediaError::NoDevice(TrackKind::Audio));
                }
                tracks.push(MediaTrack::new(TrackKind::Audio));
            }
            if constraints.video {
                if !devices.video {
                    return Err(MediaError::NoDevice(TrackKind::Video));
                }
                tracks.push(MediaTrack::new(TrackKind::Video));
            }
            Ok(MediaStream::new(tracks))
        })
    }
}
