/// Application name
pub const APP_NAME: &str = "Duet";

/// Top-level collection holding one document per chat
pub const CHATS_COLLECTION: &str = "chats";

/// Top-level collection holding one profile document per user
pub const USERS_COLLECTION: &str = "users";

/// Per-chat message collection
pub const MESSAGES_COLLECTION: &str = "messages";

/// Per-chat collection holding the call rendezvous record
pub const CALL_COLLECTION: &str = "call";

/// Well-known id of the rendezvous record inside [`CALL_COLLECTION`]
pub const SIGNALING_DOC: &str = "signaling";

/// Candidate log written by the party that created the offer
pub const CALLER_CANDIDATES: &str = "callerCandidates";

/// Candidate log written by the party that answered
pub const CALLEE_CANDIDATES: &str = "calleeCandidates";

/// Hard-expiry age for unsaved messages in `24h` mode
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 24 * 60 * 60;

/// Public STUN servers used when no ICE configuration is supplied
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// A peer whose `lastSeen` is younger than this is shown as online
pub const ONLINE_WINDOW_SECS: i64 = 60;

/// Capacity of the outward session event channel
pub const DEFAULT_EVENT_BUFFER: usize = 256;
