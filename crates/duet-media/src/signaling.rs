//! Per-chat call state machine.
//!
//! A [`CallSession`] is fed [`CallEvent`]s one at a time through
//! [`CallSession::handle`]. User commands, rendezvous snapshots, peer
//! connection events and the completion of media capture all arrive on the
//! same queue. Work that can take long (media capture, watching candidate
//! logs, draining peer events) runs in spawned tasks that post their result
//! back into the queue tagged with the attempt that started them, so results
//! from an abandoned attempt are dropped.
//!
//! Caller: `Idle -> Offering -> AwaitingAnswer -> Connected -> Ended`.
//! Callee: `Idle -> Ringing -> Answering -> Connected -> Ended`.
//! Any setup failure passes through `Error` on its way to `Ended`.

use std::sync::Arc;

use duet_shared::constants::DEFAULT_STUN_SERVERS;
use duet_shared::protocol::{CallRecord, CandidateRole, IceCandidate, SessionDescription};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::ice::CandidateBuffer;
use crate::peer::{
    LocalMedia, MediaConstraints, MediaSource, PeerConnection, PeerConnectionFactory, PeerError,
    PeerEvent, TrackKind,
};
use crate::rendezvous::SessionRendezvous;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Locked,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Offering,
    AwaitingAnswer,
    Ringing,
    Answering,
    Connected,
    Error(String),
    Ended(EndReason),
}

impl CallState {
    /// Whether a call is being set up or is up.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Offering
                | CallState::AwaitingAnswer
                | CallState::Ringing
                | CallState::Answering
                | CallState::Connected
        )
    }

    /// Caller-facing status line.
    pub fn status(&self) -> String {
        match self {
            CallState::Idle => "Idle".into(),
            CallState::Offering => "Initializing...".into(),
            CallState::AwaitingAnswer => "Calling...".into(),
            CallState::Ringing => "Incoming call".into(),
            CallState::Answering => "Answering...".into(),
            CallState::Connected => "Connected".into(),
            CallState::Error(cause) | CallState::Ended(EndReason::Failed(cause)) => {
                format!("Error: {cause}")
            }
            CallState::Ended(_) => "Call ended".into(),
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::AwaitingAnswer => "awaiting an answer",
            CallState::Ringing => "ringing",
            CallState::Answering => "answering",
            CallState::Connected => "connected",
            CallState::Error(_) => "failing",
            CallState::Ended(_) => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum CallEvent {
    /// Start a call as the caller.
    Dial,
    /// Pick up a ringing call.
    Accept,
    /// Decline a ringing call.
    Reject,
    Hangup,
    /// The device was locked or the app lost the foreground.
    Locked,
    /// A rendezvous snapshot; `None` once the record is deleted.
    Record(Option<CallRecord>),
    MediaReady {
        attempt: u64,
        result: Result<LocalMedia, PeerError>,
    },
    RemoteCandidate {
        attempt: u64,
        candidate: IceCandidate,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
}

/// Things the owner of a session should pass on, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    StateChanged(CallState),
    RemoteTrack { id: String, kind: TrackKind },
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            constraints: MediaConstraints::default(),
        }
    }
}

pub struct CallSession {
    rendezvous: SessionRendezvous,
    peers: Arc<dyn PeerConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    settings: CallSettings,
    events: mpsc::UnboundedSender<CallEvent>,

    state: CallState,
    role: Option<CandidateRole>,
    attempt: u64,
    /// Last rendezvous snapshot observed.
    record: Option<CallRecord>,
    /// Offer this side published in the current attempt.
    local_offer: Option<String>,
    /// Whether a snapshot carrying `local_offer` has come back yet.
    offer_seen: bool,
    /// Offer of the session that just ended, to recognise late redelivery.
    ended_offer: Option<String>,
    /// Whether this side may delete the record when leaving.
    owns_record: bool,

    pc: Option<Box<dyn PeerConnection>>,
    media: Option<LocalMedia>,
    candidates: CandidateBuffer,
    tasks: Vec<JoinHandle<()>>,
    notices: Vec<CallNotice>,
}

impl CallSession {
    pub fn new(
        rendezvous: SessionRendezvous,
        peers: Arc<dyn PeerConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
        settings: CallSettings,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            rendezvous,
            peers,
            media_source,
            settings,
            events,
            state: CallState::Idle,
            role: None,
            attempt: 0,
            record: None,
            local_offer: None,
            offer_seen: false,
            ended_offer: None,
            owns_record: false,
            pc: None,
            media: None,
            candidates: CandidateBuffer::new(),
            tasks: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn status(&self) -> String {
        self.state.status()
    }

    /// Notices raised since the last call.
    pub fn drain_notices(&mut self) -> Vec<CallNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Apply one event. Only commands that are not valid in the current
    /// state return an error; everything that goes wrong during setup is
    /// reported through the state instead.
    pub async fn handle(&mut self, event: CallEvent) -> Result<(), CallError> {
        let state = self.state.clone();
        match (state, event) {
            (CallState::Idle | CallState::Ended(_), CallEvent::Dial) => {
                self.dial().await;
                Ok(())
            }
            (CallState::Ringing, CallEvent::Accept) => {
                self.accept().await;
                Ok(())
            }
            (CallState::Ringing, CallEvent::Reject) => {
                self.end(EndReason::Rejected).await;
                Ok(())
            }
            (state, CallEvent::Dial | CallEvent::Accept | CallEvent::Reject) => {
                Err(CallError::InvalidState(state.to_string()))
            }
            (_, CallEvent::Hangup) => {
                self.end(EndReason::LocalHangup).await;
                Ok(())
            }
            (_, CallEvent::Locked) => {
                self.end(EndReason::Locked).await;
                Ok(())
            }
            (state, CallEvent::Record(record)) => {
                self.on_record(state, record).await;
                Ok(())
            }
            (_, CallEvent::MediaReady { attempt, result }) => {
                self.on_media(attempt, result).await;
                Ok(())
            }
            (state, CallEvent::RemoteCandidate { attempt, candidate })
                if attempt == self.attempt && state.is_active() =>
            {
                if let Some(candidate) = self.candidates.push(candidate) {
                    self.add_remote_candidate(candidate).await;
                } else {
                    debug!(pending = self.candidates.pending(), "buffered remote candidate");
                }
                Ok(())
            }
            (state, CallEvent::Peer { attempt, event })
                if attempt == self.attempt && state.is_active() =>
            {
                self.on_peer_event(event).await;
                Ok(())
            }
            (_, event) => {
                debug!(?event, attempt = self.attempt, "dropping event of a finished attempt");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn dial(&mut self) {
        self.begin_attempt(CandidateRole::Caller);
        self.set_state(CallState::Offering);
        if let Err(e) = self.watch_remote_candidates().await {
            self.fail(e).await;
            return;
        }
        self.acquire_media();
    }

    async fn accept(&mut self) {
        self.owns_record = true;
        self.set_state(CallState::Answering);
        if let Err(e) = self.watch_remote_candidates().await {
            self.fail(e).await;
            return;
        }
        self.acquire_media();
    }

    async fn on_record(&mut self, state: CallState, record: Option<CallRecord>) {
        let previous = std::mem::replace(&mut self.record, record.clone());

        match (state, record) {
            (CallState::Idle | CallState::Ended(_), None) => {
                self.ended_offer = None;
            }
            (CallState::Idle | CallState::Ended(_), Some(record)) => {
                let Some(offer) = record.offer else {
                    return;
                };
                if self.ended_offer.as_deref() == Some(offer.sdp.as_str()) {
                    debug!("ignoring redelivery of the session that just ended");
                    return;
                }
                self.begin_attempt(CandidateRole::Callee);
                self.set_state(CallState::Ringing);
            }
            // Nothing of ours is in the store yet.
            (CallState::Offering, _) => {}
            (_, None) => {
                if self.role == Some(CandidateRole::Caller) && !self.offer_seen {
                    debug!("ignoring deletion that predates our offer");
                    return;
                }
                self.remote_hangup(previous).await;
            }
            (CallState::AwaitingAnswer, Some(record)) => {
                self.note_own_offer(&record);
                if let Some(answer) = record.answer {
                    if let Err(e) = self.apply_answer(answer).await {
                        self.fail(e).await;
                    }
                }
            }
            (_, Some(record)) => self.note_own_offer(&record),
        }
    }

    async fn on_media(&mut self, attempt: u64, result: Result<LocalMedia, PeerError>) {
        let wanted = attempt == self.attempt
            && self.media.is_none()
            && matches!(self.state, CallState::Offering | CallState::Answering);
        if !wanted {
            if let Ok(media) = &result {
                self.media_source.release(media);
            }
            debug!(attempt, "discarding media of a finished attempt");
            return;
        }

        match result {
            Ok(media) => self.media = Some(media),
            Err(e) => {
                self.fail(CallError::MediaAcquisitionFailed(e.0)).await;
                return;
            }
        }

        let outcome = match self.role {
            Some(CandidateRole::Caller) => self.start_offer().await,
            _ => self.start_answer().await,
        };
        match outcome {
            Ok(()) => {}
            // The caller hung up while we were answering.
            Err(CallError::NoOffer) if self.role == Some(CandidateRole::Callee) => {
                let previous = self.record.clone();
                self.remote_hangup(previous).await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(role) = self.role else {
                    return;
                };
                if let Err(e) = self.rendezvous.append_candidate(role, &candidate).await {
                    warn!(error = %e, "failed to publish local candidate");
                }
            }
            PeerEvent::RemoteTrack { id, kind } => {
                info!(track = %id, %kind, "remote track");
                self.notices.push(CallNotice::RemoteTrack { id, kind });
            }
            PeerEvent::ConnectionFailed(cause) => {
                self.fail(CallError::PeerConnectionFailed(cause)).await;
            }
        }
    }

    /// Leave the call from this side. Deletes the record when this side
    /// published it, accepted it, or is declining it.
    async fn end(&mut self, reason: EndReason) {
        if !self.state.is_active() {
            debug!(?reason, state = %self.state, "no call to end");
            return;
        }

        let terminate = self.owns_record || self.state == CallState::Ringing;
        self.ended_offer = self.session_offer();
        self.release().await;
        if terminate {
            self.terminate().await;
        }
        self.set_state(CallState::Ended(reason));
    }

    async fn remote_hangup(&mut self, previous: Option<CallRecord>) {
        info!(state = %self.state, "rendezvous deleted by the other side");
        self.ended_offer = match self.role {
            Some(CandidateRole::Caller) => self.local_offer.clone(),
            _ => previous.and_then(|r| r.offer).map(|o| o.sdp),
        };
        self.release().await;
        self.set_state(CallState::Ended(EndReason::RemoteHangup));
    }

    async fn fail(&mut self, err: CallError) {
        error!(chat = %self.rendezvous.chat_id(), error = %err, "call failed");
        let cause = err.to_string();
        self.set_state(CallState::Error(cause.clone()));

        let terminate = self.owns_record;
        self.ended_offer = self.session_offer();
        self.release().await;
        if terminate {
            self.terminate().await;
        }
        self.set_state(CallState::Ended(EndReason::Failed(cause)));
    }

    // -----------------------------------------------------------------------
    // Offer / answer
    // -----------------------------------------------------------------------

    async fn start_offer(&mut self) -> Result<(), CallError> {
        self.open_peer().await?;

        let pc = self.peer()?;
        let offer = pc.create_offer().await.map_err(peer_failed)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(peer_failed)?;
        self.rendezvous.publish_offer(offer.clone()).await?;

        self.owns_record = true;
        self.local_offer = Some(offer.sdp);
        self.set_state(CallState::AwaitingAnswer);
        Ok(())
    }

    async fn start_answer(&mut self) -> Result<(), CallError> {
        self.open_peer().await?;

        let offer = self
            .record
            .as_ref()
            .and_then(|r| r.offer.clone())
            .ok_or(CallError::NoOffer)?;
        if self.peer()?.has_remote_description().await {
            debug!("offer already applied");
            return Ok(());
        }
        self.apply_remote(offer).await?;

        let pc = self.peer()?;
        let answer = pc.create_answer().await.map_err(peer_failed)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(peer_failed)?;
        self.rendezvous.publish_answer(answer).await?;

        self.set_state(CallState::Connected);
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        if self.peer()?.is_stable() {
            debug!("answer already applied");
            return Ok(());
        }
        self.apply_remote(answer).await?;
        self.set_state(CallState::Connected);
        Ok(())
    }

    /// Set the remote description, then flush buffered candidates in the
    /// order they arrived.
    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), CallError> {
        self.peer()?
            .set_remote_description(desc)
            .await
            .map_err(peer_failed)?;

        let flushed = self.candidates.open();
        if !flushed.is_empty() {
            debug!(count = flushed.len(), "flushing buffered candidates");
        }
        for candidate in flushed {
            self.add_remote_candidate(candidate).await;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let Some(pc) = self.pc.as_deref() else {
            return;
        };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(error = %e, "remote candidate rejected");
        }
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    fn begin_attempt(&mut self, role: CandidateRole) {
        if matches!(self.state, CallState::Ended(_)) {
            self.set_state(CallState::Idle);
        }
        self.attempt += 1;
        self.role = Some(role);
        self.local_offer = None;
        self.offer_seen = false;
        self.owns_record = false;
        self.candidates.reset();
        debug!(attempt = self.attempt, %role, "call attempt started");
    }

    async fn open_peer(&mut self) -> Result<(), CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self
            .peers
            .create(&self.settings.ice_servers, tx)
            .await
            .map_err(peer_failed)?;
        self.pc = Some(pc);

        let events = self.events.clone();
        let attempt = self.attempt;
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(CallEvent::Peer { attempt, event }).is_err() {
                    break;
                }
            }
        }));

        let tracks = self
            .media
            .as_ref()
            .map(|m| m.tracks.clone())
            .unwrap_or_default();
        for track in &tracks {
            self.peer()?.add_track(track).await.map_err(peer_failed)?;
        }
        Ok(())
    }

    async fn watch_remote_candidates(&mut self) -> Result<(), CallError> {
        let Some(role) = self.role else {
            return Ok(());
        };
        let mut stream = self.rendezvous.watch_candidates(role.opposite()).await?;

        let events = self.events.clone();
        let attempt = self.attempt;
        self.tasks.push(tokio::spawn(async move {
            while let Some(candidate) = stream.next().await {
                if events
                    .send(CallEvent::RemoteCandidate { attempt, candidate })
                    .is_err()
                {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Capture runs outside the queue; its result comes back as
    /// [`CallEvent::MediaReady`]. The task is not aborted on teardown so
    /// late media is always handed back and released.
    fn acquire_media(&self) {
        let source = self.media_source.clone();
        let constraints = self.settings.constraints;
        let events = self.events.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = source.acquire(constraints).await;
            if let Err(mpsc::error::SendError(CallEvent::MediaReady {
                result: Ok(media), ..
            })) = events.send(CallEvent::MediaReady { attempt, result })
            {
                source.release(&media);
            }
        });
    }

    /// Stop media, close the connection and stop the watchers. Safe to call
    /// more than once.
    async fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            self.media_source.release(&media);
        }
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                warn!(error = %e, "failed to close peer connection");
            }
        }
        self.candidates.reset();
        self.owns_record = false;
        self.offer_seen = false;
        self.local_offer = None;
    }

    async fn terminate(&mut self) {
        match self.rendezvous.terminate().await {
            Ok(()) => self.record = None,
            Err(CallError::Store(e)) if e.is_expected_teardown() => {
                debug!(error = %e, "rendezvous already gone");
                self.record = None;
            }
            Err(e) => warn!(error = %e, "failed to delete rendezvous"),
        }
    }

    fn peer(&self) -> Result<&dyn PeerConnection, CallError> {
        self.pc
            .as_deref()
            .ok_or_else(|| CallError::InvalidState("no peer connection".into()))
    }

    /// Offer of the session this side took part in, if any. A caller whose
    /// offer never made it out has none.
    fn session_offer(&self) -> Option<String> {
        match self.role {
            Some(CandidateRole::Caller) => self.local_offer.clone(),
            _ => self
                .record
                .as_ref()
                .and_then(|r| r.offer.as_ref())
                .map(|o| o.sdp.clone()),
        }
    }

    fn note_own_offer(&mut self, record: &CallRecord) {
        if let (Some(mine), Some(offer)) = (&self.local_offer, &record.offer) {
            if *mine == offer.sdp {
                self.offer_seen = true;
            }
        }
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "call state changed");
        self.state = next.clone();
        self.notices.push(CallNotice::StateChanged(next));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            self.media_source.release(&media);
        }
    }
}

fn peer_failed(e: PeerError) -> CallError {
    CallError::PeerConnectionFailed(e.0)
}
