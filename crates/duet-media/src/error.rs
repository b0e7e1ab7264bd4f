use duet_store::StoreError;
use thiserror::Error;

/// Failures of the call-signaling layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// An offer was published while a rendezvous record already existed.
    #[error("A call is already in progress in this chat")]
    AlreadyActive,

    /// An answer was published but the record holds no offer.
    #[error("No offer to answer")]
    NoOffer,

    #[error("Could not access camera or microphone: {0}")]
    MediaAcquisitionFailed(String),

    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// A command arrived in a state that does not accept it.
    #[error("Not possible while {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CallError::Store(e) if e.is_unavailable())
    }
}
