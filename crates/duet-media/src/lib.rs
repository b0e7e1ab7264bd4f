//! # duet-media
//!
//! Call signaling for a two-party chat: the [`SessionRendezvous`] stored in
//! the chat's document tree, the [`CallSession`] state machine that drives
//! one party through offer, answer and candidate exchange, and the host
//! capabilities it needs ([`PeerConnection`], [`MediaSource`]).

pub mod error;
pub mod ice;
pub mod peer;
pub mod rendezvous;
pub mod signaling;
pub mod webrtc_peer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::CallError;
pub use ice::CandidateBuffer;
pub use peer::{
    LocalMedia, LocalTrack, MediaConstraints, MediaSource, PeerConnection, PeerConnectionFactory,
    PeerError, PeerEvent, SyntheticMedia, TrackKind,
};
pub use rendezvous::{CandidateStream, RecordStream, RendezvousWatch, SessionRendezvous};
pub use signaling::{CallEvent, CallNotice, CallSession, CallSettings, CallState, EndReason};
pub use webrtc_peer::WebRtcPeerFactory;
