//! Host capabilities the signaling machine drives: a peer connection and a
//! source of local media tracks.

use async_trait::async_trait;
use duet_shared::protocol::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

impl PeerError {
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Tracks handed out by a [`MediaSource`]. They stay live until passed back
/// to [`MediaSource::release`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Raised by a peer connection outside of any call made on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate to hand to the other party.
    LocalCandidate(IceCandidate),
    /// Inbound media from the other party.
    RemoteTrack { id: String, kind: TrackKind },
    /// The transport gave up.
    ConnectionFailed(String),
}

/// One peer-to-peer media session. Implementations must reject
/// `add_ice_candidate` before a remote description is set; callers never
/// attempt it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn has_remote_description(&self) -> bool;
    /// Whether no offer/answer exchange is in progress.
    fn is_stable(&self) -> bool;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Open a connection using `ice_servers`. Asynchronous happenings on the
    /// connection are reported through `events`.
    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, PeerError>;
    /// Stop every track in `media`.
    fn release(&self, media: &LocalMedia);
}

/// Media source with no capture device behind it. The tracks it hands out
/// carry whatever samples the host writes to the peer connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, PeerError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: "audio".into(),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                id: "video".into(),
                kind: TrackKind::Video,
            });
        }
        if tracks.is_empty() {
            return Err(PeerError::new("no audio or video requested"));
        }
        Ok(LocalMedia { tracks })
    }

    fn release(&self, _media: &LocalMedia) {}
}
