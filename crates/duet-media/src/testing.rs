//! Scripted peer connections and media sources for tests.
//!
//! The doubles record everything done to them and enforce the one rule real
//! peer connections enforce that the signaling machine depends on: remote
//! candidates are refused until a remote description is set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use duet_shared::protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::peer::{
    LocalMedia, LocalTrack, MediaConstraints, MediaSource, PeerConnection, PeerConnectionFactory,
    PeerError, PeerEvent, TrackKind,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What was done to one scripted connection.
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    pub tracks: Vec<LocalTrack>,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    /// Remote candidates accepted, in order.
    pub candidates: Vec<IceCandidate>,
    /// Candidates offered before a remote description existed.
    pub premature_candidates: usize,
    pub closed: bool,
}

pub struct ScriptedPeer {
    label: String,
    log: Arc<Mutex<PeerLog>>,
}

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        lock(&self.log).tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(format!("{}-offer", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        match &lock(&self.log).remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(format!("{}-answer", self.label)))
            }
            _ => Err(PeerError::new("no remote offer to answer")),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        lock(&self.log).local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        lock(&self.log).remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut log = lock(&self.log);
        if log.remote.is_none() {
            log.premature_candidates += 1;
            return Err(PeerError::new("remote description not set"));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.log).remote.is_some()
    }

    fn is_stable(&self) -> bool {
        let log = lock(&self.log);
        log.local.is_some() == log.remote.is_some()
    }

    async fn close(&self) -> Result<(), PeerError> {
        lock(&self.log).closed = true;
        Ok(())
    }
}

struct Created {
    log: Arc<Mutex<PeerLog>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// Hands out [`ScriptedPeer`]s and keeps a handle on each.
pub struct ScriptedPeerFactory {
    label: String,
    created: Mutex<Vec<Created>>,
    fail_next: Mutex<Option<String>>,
}

impl ScriptedPeerFactory {
    /// `label` prefixes every description the peers produce, so offers from
    /// different factories never collide.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            created: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn fail_next_create(&self, cause: impl Into<String>) {
        *lock(&self.fail_next) = Some(cause.into());
    }

    pub fn created(&self) -> usize {
        lock(&self.created).len()
    }

    /// Log of the most recently created connection.
    pub fn last(&self) -> Option<PeerLog> {
        lock(&self.created).last().map(|c| lock(&c.log).clone())
    }

    /// Raise `event` on the most recently created connection.
    pub fn emit(&self, event: PeerEvent) -> bool {
        match lock(&self.created).last() {
            Some(created) => created.events.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        if let Some(cause) = lock(&self.fail_next).take() {
            return Err(PeerError(cause));
        }

        let mut created = lock(&self.created);
        let log = Arc::new(Mutex::new(PeerLog::default()));
        created.push(Created {
            log: log.clone(),
            events,
        });
        Ok(Box::new(ScriptedPeer {
            label: format!("{}-{}", self.label, created.len()),
            log,
        }))
    }
}

/// Media source that hands out one track per requested kind and counts
/// what is still live.
#[derive(Default)]
pub struct ScriptedMedia {
    failure: Mutex<Option<String>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition fails with `cause` until cleared.
    pub fn fail_with(&self, cause: Option<&str>) {
        *lock(&self.failure) = cause.map(str::to_string);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Acquisitions not yet released.
    pub fn live(&self) -> usize {
        self.acquired() - self.released()
    }
}

#[async_trait]
impl MediaSource for ScriptedMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, PeerError> {
        if let Some(cause) = lock(&self.failure).clone() {
            return Err(PeerError(cause));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: "mic".into(),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                id: "camera".into(),
                kind: TrackKind::Video,
            });
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia { tracks })
    }

    fn release(&self, _media: &LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
