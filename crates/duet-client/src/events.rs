use duet_media::{CallState, TrackKind};
use duet_shared::UserId;
use duet_store::{ChatSettings, Message, PeerProfile};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Everything a chat session reports to its host, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The other party is calling. Answer with `accept_call` or
    /// `reject_call`.
    IncomingCall {
        from: UserId,
        display_name: Option<String>,
    },
    CallStateChanged(CallState),
    /// Human-readable line for the call or the last failed action.
    Status(String),
    /// The materialized message list, oldest first.
    MessagesUpdated(Vec<Message>),
    SettingsChanged(ChatSettings),
    PeerProfile(PeerProfile),
    RemoteTrack {
        id: String,
        kind: TrackKind,
    },
}

/// Deliver without waiting. A host that stops reading loses events rather
/// than stalling the session.
pub(crate) fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::warn!(?event, "Session event buffer full, dropping event");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Session event receiver dropped");
        }
    }
}
