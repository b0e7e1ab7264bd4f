//! The chat coordinator.
//!
//! [`ChatSession::open`] subscribes to the chat's settings, rendezvous,
//! message stream and the peer's profile, then hands everything to one
//! spawned task. That task is the only place chat state changes: store
//! pushes, call events, the lock signal and commands sent through a
//! [`ChatHandle`] are processed one at a time.

use std::sync::Arc;

use duet_media::{
    CallEvent, CallNotice, CallSession, CallState, MediaSource, PeerConnectionFactory,
    RecordStream, SessionRendezvous, SyntheticMedia, WebRtcPeerFactory,
};
use duet_shared::{ChatId, Clock, MessageId, SystemClock, UserId};
use duet_store::messages::decode_messages;
use duet_store::{
    ChatDocuments, ChatSettings, DisappearingMode, DocStream, Document, Message, PeerProfile,
    QuerySnapshot, QueryStream, RealtimeStore, ReplySnapshot,
};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::events::{emit, SessionEvent};
use crate::lifecycle::{Draft, MessageLifecycle};

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct ChatDeps {
    pub store: Arc<dyn RealtimeStore>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    pub clock: Arc<dyn Clock>,
}

impl ChatDeps {
    /// `webrtc` peer connections, synthetic media and the system clock.
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self {
            store,
            peers: Arc::new(WebRtcPeerFactory),
            media: Arc::new(SyntheticMedia),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = media;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Dial,
    Accept,
    Reject,
    Hangup,
}

impl From<CallCommand> for CallEvent {
    fn from(cmd: CallCommand) -> Self {
        match cmd {
            CallCommand::Dial => CallEvent::Dial,
            CallCommand::Accept => CallEvent::Accept,
            CallCommand::Reject => CallEvent::Reject,
            CallCommand::Hangup => CallEvent::Hangup,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

enum ChatCommand {
    Send(Draft, Reply<MessageId>),
    Reply(MessageId, Reply<ReplySnapshot>),
    CancelReply(Reply<()>),
    ToggleSaved(MessageId, Reply<bool>),
    Delete(MessageId, Reply<()>),
    Restore(Reply<usize>),
    SetMode(DisappearingMode, Reply<()>),
    SetWallpaper(Option<String>, Reply<()>),
    Call(CallCommand, Reply<()>),
    Messages(Reply<Vec<Message>>),
    CallState(Reply<CallState>),
    Close(Reply<()>),
}

/// Cloneable handle to a running session. The session tears itself down
/// when the last handle is dropped.
#[derive(Clone)]
pub struct ChatHandle {
    chat_id: ChatId,
    viewer: UserId,
    peer: UserId,
    commands: mpsc::Sender<ChatCommand>,
}

impl ChatHandle {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ChatCommand) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    pub async fn send(&self, draft: Draft) -> Result<MessageId, ChatError> {
        self.request(|r| ChatCommand::Send(draft, r)).await
    }

    /// Quote `id` in the next message sent.
    pub async fn reply(&self, id: &MessageId) -> Result<ReplySnapshot, ChatError> {
        let id = id.clone();
        self.request(|r| ChatCommand::Reply(id, r)).await
    }

    pub async fn cancel_reply(&self) -> Result<(), ChatError> {
        self.request(ChatCommand::CancelReply).await
    }

    pub async fn toggle_saved(&self, id: &MessageId) -> Result<bool, ChatError> {
        let id = id.clone();
        self.request(|r| ChatCommand::ToggleSaved(id, r)).await
    }

    pub async fn delete(&self, id: &MessageId) -> Result<(), ChatError> {
        let id = id.clone();
        self.request(|r| ChatCommand::Delete(id, r)).await
    }

    /// Unhide every message in the chat. Returns how many were hidden.
    pub async fn restore(&self) -> Result<usize, ChatError> {
        self.request(ChatCommand::Restore).await
    }

    pub async fn set_disappearing_mode(&self, mode: DisappearingMode) -> Result<(), ChatError> {
        self.request(|r| ChatCommand::SetMode(mode, r)).await
    }

    pub async fn set_wallpaper(&self, url: Option<String>) -> Result<(), ChatError> {
        self.request(|r| ChatCommand::SetWallpaper(url, r)).await
    }

    pub async fn start_call(&self) -> Result<(), ChatError> {
        self.call(CallCommand::Dial).await
    }

    pub async fn accept_call(&self) -> Result<(), ChatError> {
        self.call(CallCommand::Accept).await
    }

    pub async fn reject_call(&self) -> Result<(), ChatError> {
        self.call(CallCommand::Reject).await
    }

    pub async fn end_call(&self) -> Result<(), ChatError> {
        self.call(CallCommand::Hangup).await
    }

    async fn call(&self, cmd: CallCommand) -> Result<(), ChatError> {
        self.request(|r| ChatCommand::Call(cmd, r)).await
    }

    pub async fn messages(&self) -> Result<Vec<Message>, ChatError> {
        self.request(ChatCommand::Messages).await
    }

    pub async fn call_state(&self) -> Result<CallState, ChatError> {
        self.request(ChatCommand::CallState).await
    }

    /// Leave the chat: hide seen messages in instant mode, end any call and
    /// drop every subscription. Closing twice is not an error.
    pub async fn close(&self) -> Result<(), ChatError> {
        match self.request(ChatCommand::Close).await {
            Err(ChatError::SessionClosed) => Ok(()),
            other => other,
        }
    }
}

struct Subscriptions {
    settings: DocStream,
    record: RecordStream,
    messages: QueryStream,
    profile: DocStream,
    lock: watch::Receiver<bool>,
}

pub struct ChatSession {
    docs: ChatDocuments,
    peer: UserId,
    lifecycle: MessageLifecycle,
    call: CallSession,
    profile: PeerProfile,
    events: mpsc::Sender<SessionEvent>,
}

impl ChatSession {
    /// Open the chat between `viewer` and `peer`. `lock` turning `true`
    /// ends any call in progress.
    pub async fn open(
        config: &ChatConfig,
        deps: ChatDeps,
        viewer: UserId,
        peer: UserId,
        lock: watch::Receiver<bool>,
    ) -> Result<(ChatHandle, mpsc::Receiver<SessionEvent>), ChatError> {
        let chat_id = ChatId::between(&viewer, &peer);
        let docs = ChatDocuments::new(deps.store.clone(), chat_id.clone());
        let rendezvous = SessionRendezvous::new(docs.clone());

        // Retention must not run under the default mode before the real one
        // is known.
        let settings = docs.get_settings().await?;
        let mut lifecycle = MessageLifecycle::new(
            docs.clone(),
            viewer.clone(),
            peer.clone(),
            deps.clock,
            config.message_ttl(),
        );
        lifecycle.set_mode(settings.disappearing_mode).await;

        let subscriptions = Subscriptions {
            settings: deps.store.subscribe_doc(&docs.chat_doc()).await?,
            record: rendezvous.watch_record().await?,
            messages: deps.store.subscribe_query(&docs.messages_query()).await?,
            profile: deps
                .store
                .subscribe_doc(&ChatDocuments::profile_doc(&peer))
                .await?,
            lock,
        };

        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let call = CallSession::new(
            rendezvous,
            deps.peers,
            deps.media,
            config.call_settings(),
            call_tx,
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(config.event_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        let session = ChatSession {
            docs,
            peer: peer.clone(),
            lifecycle,
            call,
            profile: PeerProfile::default(),
            events: event_tx,
        };
        tokio::spawn(session.run(cmd_rx, call_rx, subscriptions));

        info!(chat = %chat_id, viewer = %viewer.short(), "chat session opened");
        Ok((
            ChatHandle {
                chat_id,
                viewer,
                peer,
                commands: cmd_tx,
            },
            event_rx,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ChatCommand>,
        mut call_events: mpsc::UnboundedReceiver<CallEvent>,
        mut subs: Subscriptions,
    ) {
        let mut lock_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        info!("All chat handles dropped, closing session");
                        self.teardown().await;
                        break;
                    }
                },

                Some(event) = call_events.recv() => {
                    let _ = self.drive_call(event).await;
                }

                Some(record) = subs.record.next() => {
                    let _ = self.drive_call(CallEvent::Record(record)).await;
                }

                Some(doc) = subs.settings.next() => self.on_settings(doc).await,

                Some(snapshot) = subs.messages.next() => self.on_messages(snapshot).await,

                Some(doc) = subs.profile.next() => self.on_profile(doc),

                changed = subs.lock.changed(), if lock_open => match changed {
                    Ok(()) => {
                        let locked = *subs.lock.borrow_and_update();
                        if locked {
                            info!("Device locked, ending any call");
                            let _ = self.drive_call(CallEvent::Locked).await;
                        }
                    }
                    Err(_) => lock_open = false,
                },
            }
        }

        info!(chat = %self.docs.chat_id(), "chat session closed");
    }

    /// Returns `false` once the session should stop.
    async fn handle_command(&mut self, cmd: ChatCommand) -> bool {
        match cmd {
            ChatCommand::Send(draft, reply) => {
                let result = self.lifecycle.send(draft).await;
                self.respond(reply, result);
            }
            ChatCommand::Reply(id, reply) => {
                let result = self.lifecycle.reply(&id);
                self.respond(reply, result);
            }
            ChatCommand::CancelReply(reply) => {
                self.lifecycle.cancel_reply();
                self.respond(reply, Ok(()));
            }
            ChatCommand::ToggleSaved(id, reply) => {
                let result = self.lifecycle.toggle_saved(&id).await;
                self.respond(reply, result);
            }
            ChatCommand::Delete(id, reply) => {
                let result = self.lifecycle.delete(&id).await;
                self.respond(reply, result);
            }
            ChatCommand::Restore(reply) => {
                let result = self.lifecycle.restore().await;
                self.respond(reply, result);
            }
            ChatCommand::SetMode(mode, reply) => {
                let result = self.docs.set_disappearing_mode(mode).await;
                if result.is_ok() {
                    self.apply_mode(mode).await;
                }
                self.respond(reply, result.map_err(ChatError::from));
            }
            ChatCommand::SetWallpaper(url, reply) => {
                let result = self.docs.set_wallpaper(url.as_deref()).await;
                self.respond(reply, result.map_err(ChatError::from));
            }
            ChatCommand::Call(cmd, reply) => {
                let result = self.drive_call(cmd.into()).await;
                self.respond(reply, result);
            }
            ChatCommand::Messages(reply) => {
                let _ = reply.send(Ok(self.lifecycle.visible().to_vec()));
            }
            ChatCommand::CallState(reply) => {
                let _ = reply.send(Ok(self.call.state().clone()));
            }
            ChatCommand::Close(reply) => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn respond<T>(&self, reply: Reply<T>, result: Result<T, ChatError>) {
        if let Err(e) = &result {
            warn!(error = %e, "Chat command failed");
            emit(&self.events, SessionEvent::Status(e.status()));
        }
        let _ = reply.send(result);
    }

    /// Feed the call machine and pass its notices on.
    async fn drive_call(&mut self, event: CallEvent) -> Result<(), ChatError> {
        let result = self.call.handle(event).await;

        for notice in self.call.drain_notices() {
            match notice {
                CallNotice::StateChanged(state) => {
                    if state == CallState::Ringing {
                        emit(
                            &self.events,
                            SessionEvent::IncomingCall {
                                from: self.peer.clone(),
                                display_name: self.profile.label().map(str::to_string),
                            },
                        );
                    }
                    let status = state.status();
                    emit(&self.events, SessionEvent::CallStateChanged(state));
                    emit(&self.events, SessionEvent::Status(status));
                }
                CallNotice::RemoteTrack { id, kind } => {
                    emit(&self.events, SessionEvent::RemoteTrack { id, kind });
                }
            }
        }

        result.map_err(ChatError::from)
    }

    async fn apply_mode(&mut self, mode: DisappearingMode) {
        let visible = self.lifecycle.set_mode(mode).await.map(<[Message]>::to_vec);
        if let Some(visible) = visible {
            emit(&self.events, SessionEvent::MessagesUpdated(visible));
        }
    }

    async fn on_settings(&mut self, doc: Option<Document>) {
        let settings = match ChatSettings::from_document(doc.as_ref()) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed chat settings");
                return;
            }
        };

        if settings.disappearing_mode != self.lifecycle.mode() {
            self.apply_mode(settings.disappearing_mode).await;
        }
        emit(&self.events, SessionEvent::SettingsChanged(settings));
    }

    async fn on_messages(&mut self, snapshot: QuerySnapshot) {
        debug!(
            total = snapshot.documents.len(),
            changes = snapshot.changes.len(),
            "message snapshot"
        );
        let messages = decode_messages(&snapshot.documents);
        let visible = self.lifecycle.observe(messages).await.to_vec();
        emit(&self.events, SessionEvent::MessagesUpdated(visible));
    }

    fn on_profile(&mut self, doc: Option<Document>) {
        let profile = match doc.map(|d| d.decode::<PeerProfile>()) {
            Some(Ok(profile)) => profile,
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring malformed peer profile");
                return;
            }
            None => PeerProfile::default(),
        };
        self.profile = profile.clone();
        emit(&self.events, SessionEvent::PeerProfile(profile));
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.lifecycle.hide_seen_on_exit().await {
            warn!(error = %e, "Failed to hide seen messages on exit");
        }
        if self.call.state().is_active() {
            let _ = self.drive_call(CallEvent::Hangup).await;
        }
    }
}
