//! Typed records stored in the realtime document store.
//!
//! Field names are camelCase on the wire so records written by other
//! clients of the same backend decode unchanged.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use duet_shared::{MessageId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{to_fields, Document, Fields};

// ---------------------------------------------------------------------------
// Chat settings
// ---------------------------------------------------------------------------

/// Retention policy of a chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisappearingMode {
    /// Seen messages are hidden from the viewer when they leave the chat.
    #[serde(rename = "instant")]
    Instant,
    /// Unsaved messages are deleted once they are a day old.
    #[default]
    #[serde(rename = "24h")]
    Day,
    /// Messages are kept.
    #[serde(rename = "off")]
    Off,
}

impl DisappearingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisappearingMode::Instant => "instant",
            DisappearingMode::Day => "24h",
            DisappearingMode::Off => "off",
        }
    }
}

impl std::fmt::Display for DisappearingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DisappearingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "instant" => Ok(DisappearingMode::Instant),
            "24h" => Ok(DisappearingMode::Day),
            "off" => Ok(DisappearingMode::Off),
            other => Err(format!("unknown disappearing mode: {other}")),
        }
    }
}

/// Per-chat settings document. Either participant may write it; the last
/// write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default)]
    pub disappearing_mode: DisappearingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallpaper_url: Option<String>,
}

impl ChatSettings {
    /// Decode the settings document. A missing document yields defaults.
    pub fn from_document(doc: Option<&Document>) -> Result<Self> {
        match doc {
            Some(doc) => doc.decode(),
            None => Ok(Self::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    File,
}

impl From<MediaKind> for MessageKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => MessageKind::Image,
            MediaKind::Video => MessageKind::Video,
            MediaKind::File => MessageKind::File,
        }
    }
}

/// An uploaded attachment. The upload itself happens elsewhere; only the
/// resulting URL is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub file_name: String,
}

/// Copy of a message taken when a reply is composed. It is never refreshed,
/// so it goes stale if the original is later changed or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub id: MessageId,
    #[serde(default)]
    pub text: Option<String>,
    pub sender_id: UserId,
    pub kind: MessageKind,
    #[serde(default)]
    pub url: Option<String>,
}

/// A chat message as stored. `id` is the document id and is not a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub hidden_for: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
}

impl Message {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut message: Message = doc.decode()?;
        message.id = MessageId(doc.id().to_string());
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        self.media
            .as_ref()
            .map(|m| m.kind.into())
            .unwrap_or(MessageKind::Text)
    }

    pub fn is_hidden_for(&self, viewer: &UserId) -> bool {
        self.hidden_for.contains(viewer)
    }

    /// Whether the message is at least `ttl` old at `now`.
    pub fn is_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }

    pub fn reply_snapshot(&self) -> ReplySnapshot {
        ReplySnapshot {
            id: self.id.clone(),
            text: self.text.clone(),
            sender_id: self.sender_id.clone(),
            kind: self.kind(),
            url: self.media.as_ref().map(|m| m.url.clone()),
        }
    }

    /// Ordering key: creation time, then store-assigned id.
    pub fn order_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }
}

/// A message about to be appended. Receipt, pin and hide state always start
/// cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub text: Option<String>,
    pub media: Option<MediaAttachment>,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<ReplySnapshot>,
}

impl NewMessage {
    pub fn to_fields(&self) -> Result<Fields> {
        to_fields(&Message {
            id: MessageId::default(),
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            media: self.media.clone(),
            created_at: self.created_at,
            seen: false,
            saved: false,
            hidden_for: BTreeSet::new(),
            reply_to: self.reply_to.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Peer profile
// ---------------------------------------------------------------------------

/// Public profile document of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "photoURL", alias = "photoUrl")]
    pub photo_url: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerProfile {
    /// Name to show for this peer: display name, else email.
    pub fn label(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
    }
}
