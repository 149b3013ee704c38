//! Local media capability boundary.
//!
//! Capture itself happens elsewhere; the core only needs an opaque handle
//! naming the tracks it should attach to a peer connection, and a way to
//! release them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media capability denied: {0}")]
    Denied(String),
    #[error("media capability unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    /// `""` requests audio and video, `"a"` audio only, `"v"` video only.
    /// Anything else falls back to audio and video.
    pub fn from_preset(preset: Option<&str>) -> Self {
        match preset.map(str::trim) {
            Some("a") => Self {
                audio: true,
                video: false,
            },
            Some("v") => Self {
                audio: false,
                video: true,
            },
            _ => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub id: String,
    pub label: String,
}

/// Handle to acquired local media. Dropping it releases the tracks.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
    live: Arc<AtomicBool>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Observer that stays valid after the handle is dropped.
    pub fn liveness(&self) -> MediaLiveness {
        MediaLiveness(Arc::clone(&self.live))
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(stream = %self.stream_id, tracks = self.tracks.len(), "local media released");
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone)]
pub struct MediaLiveness(Arc<AtomicBool>);

impl MediaLiveness {
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Source that hands out placeholder tracks for every requested kind.
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    device_label: String,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new("synthetic")
    }
}

impl SyntheticMediaSource {
    pub fn new(device_label: impl Into<String>) -> Self {
        Self {
            device_label: device_label.into(),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.is_empty() {
            return Err(MediaError::Unavailable("no media kinds requested".into()));
        }
        let mut tracks = Vec::new();
        for (wanted, kind) in [
            (constraints.audio, TrackKind::Audio),
            (constraints.video, TrackKind::Video),
        ] {
            if wanted {
                tracks.push(LocalTrack {
                    kind,
                    id: Uuid::new_v4().to_string(),
                    label: format!("{} {kind}", self.device_label),
                });
            }
        }
        for track in &tracks {
            info!(kind = %track.kind, device = %track.label, "using {} device", track.kind);
        }
        Ok(LocalMedia::new(Uuid::new_v4().to_string(), tracks))
    }
}

/// Source that always refuses, as a user declining a capture prompt would.
#[derive(Debug, Clone, Default)]
pub struct DeniedMediaSource;

#[async_trait]
impl MediaSource for DeniedMediaSource {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        Err(MediaError::Denied("permission dismissed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_map_to_constraints() {
        assert_eq!(MediaConstraints::from_preset(None), MediaConstraints::default());
        assert_eq!(MediaConstraints::from_preset(Some("")), MediaConstraints::default());
        assert!(!MediaConstraints::from_preset(Some("a")).video);
        assert!(!MediaConstraints::from_preset(Some("v")).audio);
        assert_eq!(
            MediaConstraints::from_preset(Some("stereo")),
            MediaConstraints::default()
        );
    }

    #[tokio::test]
    async fn synthetic_source_honours_constraints() {
        let media = SyntheticMediaSource::default()
            .acquire(MediaConstraints::from_preset(Some("a")))
            .await
            .expect("acquire");
        assert_eq!(media.tracks().len(), 1);
        assert!(media.track(TrackKind::Audio).is_some());
        assert!(media.track(TrackKind::Video).is_none());
    }

    #[tokio::test]
    async fn empty_request_is_unavailable() {
        let err = SyntheticMediaSource::default()
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .expect_err("nothing to capture");
        assert!(matches!(err, MediaError::Unavailable(_)));
    }

    #[test]
    fn dropping_the_handle_releases_tracks() {
        let media = LocalMedia::new("stream", vec![]);
        let liveness = media.liveness();
        assert!(liveness.is_live());
        drop(media);
        assert!(!liveness.is_live());
    }
}
