//! Message visibility and retention for one viewer of one chat.
//!
//! [`evaluate`] is the pure policy: given a snapshot of the message stream
//! it decides what the viewer sees, what has expired and which receipts
//! are owed. [`MessageLifecycle`] applies that decision to the store on
//! every snapshot and carries the user-facing message operations.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use duet_shared::{Clock, MessageId, UserId};
use duet_store::{
    ChatDocuments, DisappearingMode, MediaAttachment, Message, NewMessage, ReplySnapshot,
    StoreError,
};
use tracing::{debug, info, warn};

use crate::error::ChatError;

/// Outcome of evaluating one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// What the viewer sees, oldest first.
    pub visible: Vec<Message>,
    /// Past the hard-expiry age and not saved.
    pub expired: Vec<MessageId>,
    /// Visible, from the other party, not yet seen.
    pub to_mark_seen: Vec<MessageId>,
}

pub fn evaluate(
    messages: &[Message],
    viewer: &UserId,
    mode: DisappearingMode,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Evaluation {
    let mut ordered: Vec<&Message> = messages.iter().collect();
    ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut eval = Evaluation::default();
    for message in ordered {
        // Saved messages are never expired or hidden.
        if !message.saved {
            if mode == DisappearingMode::Day && message.is_older_than(ttl, now) {
                eval.expired.push(message.id.clone());
                continue;
            }
            if message.is_hidden_for(viewer) {
                continue;
            }
        }

        if message.sender_id != *viewer && !message.seen {
            eval.to_mark_seen.push(message.id.clone());
        }
        eval.visible.push(message.clone());
    }
    eval
}

/// A message being composed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: Option<String>,
    pub media: Option<MediaAttachment>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(media: MediaAttachment) -> Self {
        Self {
            text: None,
            media: Some(media),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_none()
            && self
                .text
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
    }
}

pub struct MessageLifecycle {
    docs: ChatDocuments,
    viewer: UserId,
    peer: UserId,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    mode: DisappearingMode,
    /// Raw messages of the last snapshot, kept for re-evaluation.
    last: Option<Vec<Message>>,
    visible: Vec<Message>,
    /// Writes issued whose effect the store has not echoed back yet.
    pending_seen: HashSet<MessageId>,
    pending_delete: HashSet<MessageId>,
    reply: Option<ReplySnapshot>,
}

impl MessageLifecycle {
    pub fn new(
        docs: ChatDocuments,
        viewer: UserId,
        peer: UserId,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            docs,
            viewer,
            peer,
            clock,
            ttl,
            mode: DisappearingMode::default(),
            last: None,
            visible: Vec::new(),
            pending_seen: HashSet::new(),
            pending_delete: HashSet::new(),
            reply: None,
        }
    }

    pub fn mode(&self) -> DisappearingMode {
        self.mode
    }

    pub fn visible(&self) -> &[Message] {
        &self.visible
    }

    pub fn pending_reply(&self) -> Option<&ReplySnapshot> {
        self.reply.as_ref()
    }

    /// Apply a new snapshot of the message stream.
    pub async fn observe(&mut self, messages: Vec<Message>) -> &[Message] {
        self.last = Some(messages);
        self.reevaluate().await;
        &self.visible
    }

    /// Switch policy. The last snapshot is evaluated again under the new
    /// mode; returns `None` when nothing has been observed yet.
    pub async fn set_mode(&mut self, mode: DisappearingMode) -> Option<&[Message]> {
        if mode != self.mode {
            info!(chat = %self.docs.chat_id(), from = %self.mode, to = %mode, "disappearing mode changed");
            self.mode = mode;
        }
        self.last.as_ref()?;
        self.reevaluate().await;
        Some(&self.visible)
    }

    async fn reevaluate(&mut self) {
        let Some(messages) = self.last.as_ref() else {
            return;
        };
        let eval = evaluate(messages, &self.viewer, self.mode, self.clock.now(), self.ttl);
        let present: HashSet<&MessageId> = messages.iter().map(|m| &m.id).collect();

        self.pending_delete.retain(|id| present.contains(id));
        self.pending_seen
            .retain(|id| eval.to_mark_seen.contains(id));

        for id in &eval.expired {
            if !self.pending_delete.insert(id.clone()) {
                continue;
            }
            debug!(message = %id, "deleting expired message");
            if let Err(e) = self.docs.delete_message(id).await {
                log_write_failure("delete", id, &e);
                self.pending_delete.remove(id);
            }
        }

        for id in &eval.to_mark_seen {
            if !self.pending_seen.insert(id.clone()) {
                continue;
            }
            if let Err(e) = self.docs.mark_seen(id).await {
                log_write_failure("mark seen", id, &e);
                if !e.is_expected_teardown() {
                    self.pending_seen.remove(id);
                }
            }
        }

        self.visible = eval.visible;
    }

    /// Hide every seen, unsaved message from the other party. Runs once when
    /// the viewer leaves a chat in instant mode; other modes do nothing.
    pub async fn hide_seen_on_exit(&self) -> Result<usize, ChatError> {
        if self.mode != DisappearingMode::Instant {
            return Ok(0);
        }

        let mut hidden = 0;
        for message in self.docs.seen_messages_from(&self.peer).await? {
            if message.saved || message.is_hidden_for(&self.viewer) {
                continue;
            }
            match self.docs.hide_for(&message.id, &self.viewer).await {
                Ok(()) => hidden += 1,
                Err(e) if e.is_expected_teardown() => log_write_failure("hide", &message.id, &e),
                Err(e) => return Err(e.into()),
            }
        }

        info!(chat = %self.docs.chat_id(), hidden, "hid seen messages on exit");
        Ok(hidden)
    }

    /// Flip `saved`. Returns the new value.
    pub async fn toggle_saved(&self, id: &MessageId) -> Result<bool, ChatError> {
        let message = self
            .docs
            .get_message(id)
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
        let saved = !message.saved;
        self.docs.set_saved(id, saved).await?;
        debug!(message = %id, saved, "toggled saved");
        Ok(saved)
    }

    pub async fn delete(&self, id: &MessageId) -> Result<(), ChatError> {
        let message = self
            .docs
            .get_message(id)
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
        if message.saved {
            return Err(ChatError::SavedMessageProtected);
        }
        self.docs.delete_message(id).await?;
        Ok(())
    }

    /// Clear `hiddenFor` on every message of the chat. Deleted messages stay
    /// deleted.
    pub async fn restore(&self) -> Result<usize, ChatError> {
        let mut restored = 0;
        for message in self.docs.list_messages().await? {
            if message.hidden_for.is_empty() {
                continue;
            }
            match self.docs.clear_hidden(&message.id).await {
                Ok(()) => restored += 1,
                Err(e) if e.is_expected_teardown() => {
                    log_write_failure("restore", &message.id, &e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(chat = %self.docs.chat_id(), restored, "restored hidden messages");
        Ok(restored)
    }

    /// Capture `id` as the reply target of the next sent message.
    pub fn reply(&mut self, id: &MessageId) -> Result<ReplySnapshot, ChatError> {
        let snapshot = self
            .last
            .iter()
            .flatten()
            .find(|m| m.id == *id)
            .map(Message::reply_snapshot)
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
        self.reply = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn cancel_reply(&mut self) {
        self.reply = None;
    }

    /// Append a message from the viewer. The pending reply is attached and
    /// cleared once the append succeeds.
    pub async fn send(&mut self, draft: Draft) -> Result<MessageId, ChatError> {
        if draft.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = NewMessage {
            sender_id: self.viewer.clone(),
            text: draft.text.filter(|t| !t.trim().is_empty()),
            media: draft.media,
            created_at: self.clock.now(),
            reply_to: self.reply.clone(),
        };
        let id = self.docs.append_message(&message).await?;
        self.reply = None;
        debug!(message = %id, "sent message");
        Ok(id)
    }
}

fn log_write_failure(action: &str, id: &MessageId, e: &StoreError) {
    if e.is_expected_teardown() {
        debug!(action, message = %id, error = %e, "write raced a delete");
    } else {
        warn!(action, message = %id, error = %e, "message write failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone;
    use duet_shared::{ChatId, ManualClock};
    use duet_store::MemoryStore;

    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn message(id: &str, sender: &str, age: Duration) -> Message {
        Message {
            id: MessageId(id.into()),
            sender_id: user(sender),
            text: Some(id.into()),
            media: None,
            created_at: now() - age,
            seen: false,
            saved: false,
            hidden_for: BTreeSet::new(),
            reply_to: None,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_day_mode_expires_unsaved_only() {
        let mut saved = message("saved", "bob", Duration::hours(30));
        saved.saved = true;
        let messages = vec![
            message("old", "bob", Duration::hours(25)),
            saved,
            message("new", "bob", Duration::hours(1)),
        ];

        let eval = evaluate(&messages, &user("alice"), DisappearingMode::Day, now(), Duration::hours(24));
        assert_eq!(eval.expired, vec![MessageId("old".into())]);
        assert_eq!(ids(&eval.visible), vec!["saved", "new"]);

        let eval = evaluate(&messages, &user("alice"), DisappearingMode::Off, now(), Duration::hours(24));
        assert!(eval.expired.is_empty());
        assert_eq!(eval.visible.len(), 3);
    }

    #[test]
    fn test_hidden_messages_excluded_for_that_viewer() {
        let mut hidden = message("m1", "bob", Duration::minutes(1));
        hidden.hidden_for.insert(user("alice"));
        let messages = vec![hidden];

        let for_alice = evaluate(&messages, &user("alice"), DisappearingMode::Instant, now(), Duration::hours(24));
        let for_bob = evaluate(&messages, &user("bob"), DisappearingMode::Instant, now(), Duration::hours(24));
        assert!(for_alice.visible.is_empty());
        assert_eq!(for_bob.visible.len(), 1);
    }

    #[test]
    fn test_ties_break_on_id_and_receipts_skip_own_messages() {
        let mut b = message("b", "bob", Duration::zero());
        let a = message("a", "alice", Duration::zero());
        let mut c = message("c", "bob", Duration::zero());
        c.seen = true;
        b.created_at = a.created_at;

        let eval = evaluate(&[c, b, a], &user("alice"), DisappearingMode::Off, now(), Duration::hours(24));
        assert_eq!(ids(&eval.visible), vec!["a", "b", "c"]);
        assert_eq!(eval.to_mark_seen, vec![MessageId("b".into())]);
    }

    fn lifecycle(store: Arc<MemoryStore>, viewer: &str) -> MessageLifecycle {
        let docs = ChatDocuments::new(store, ChatId::between(&user("alice"), &user("bob")));
        let peer = if viewer == "alice" { "bob" } else { "alice" };
        MessageLifecycle::new(
            docs,
            user(viewer),
            user(peer),
            Arc::new(ManualClock::new(now())),
            Duration::hours(24),
        )
    }

    #[tokio::test]
    async fn test_delete_refuses_saved_messages() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store, "alice");

        let id = alice.send(Draft::text("keep me")).await.unwrap();
        assert!(alice.toggle_saved(&id).await.unwrap());
        assert_eq!(alice.delete(&id).await, Err(ChatError::SavedMessageProtected));

        assert!(!alice.toggle_saved(&id).await.unwrap());
        alice.delete(&id).await.unwrap();
        assert_eq!(
            alice.delete(&id).await,
            Err(ChatError::MessageNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_send_attaches_and_clears_reply() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store.clone(), "alice");
        let mut bob = lifecycle(store, "bob");

        assert_eq!(alice.send(Draft::text("   ")).await, Err(ChatError::EmptyMessage));

        let first = bob.send(Draft::text("question")).await.unwrap();
        let messages = alice.docs.list_messages().await.unwrap();
        alice.observe(messages).await;

        let snapshot = alice.reply(&first).unwrap();
        assert_eq!(snapshot.text.as_deref(), Some("question"));

        let answer = alice.send(Draft::text("answer")).await.unwrap();
        assert!(alice.pending_reply().is_none());

        let stored = alice.docs.get_message(&answer).await.unwrap().unwrap();
        assert_eq!(stored.reply_to.unwrap().id, first);

        alice.reply(&first).unwrap();
        alice.cancel_reply();
        let plain = alice.send(Draft::text("plain")).await.unwrap();
        assert!(alice.docs.get_message(&plain).await.unwrap().unwrap().reply_to.is_none());
    }

    #[tokio::test]
    async fn test_observe_marks_seen_once() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store.clone(), "alice");
        let mut bob = lifecycle(store, "bob");

        let id = bob.send(Draft::text("hi")).await.unwrap();
        let messages = alice.docs.list_messages().await.unwrap();
        let visible = alice.observe(messages.clone()).await.to_vec();
        assert_eq!(visible.len(), 1);
        assert!(alice.docs.get_message(&id).await.unwrap().unwrap().seen);

        // A stale redelivery does not trigger a second write.
        alice.observe(messages).await;
        assert!(alice.pending_seen.contains(&id));
    }

    #[tokio::test]
    async fn test_mode_change_reevaluates_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store, "alice");
        alice.set_mode(DisappearingMode::Off).await;

        let old = NewMessage {
            sender_id: user("bob"),
            text: Some("old".into()),
            media: None,
            created_at: now() - Duration::hours(26),
            reply_to: None,
        };
        let id = alice.docs.append_message(&old).await.unwrap();
        let messages = alice.docs.list_messages().await.unwrap();
        assert_eq!(alice.observe(messages).await.len(), 1);

        let visible = alice.set_mode(DisappearingMode::Day).await.unwrap();
        assert!(visible.is_empty());
        assert!(alice.docs.get_message(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instant_exit_hides_then_restore_clears() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store.clone(), "alice");
        let mut bob = lifecycle(store, "bob");
        alice.set_mode(DisappearingMode::Instant).await;

        let seen = bob.send(Draft::text("seen")).await.unwrap();
        let pinned = bob.send(Draft::text("pinned")).await.unwrap();
        bob.send(Draft::text("unseen")).await.unwrap();
        let own = alice.send(Draft::text("mine")).await.unwrap();
        alice.docs.mark_seen(&seen).await.unwrap();
        alice.docs.mark_seen(&pinned).await.unwrap();
        bob.toggle_saved(&pinned).await.unwrap();

        assert_eq!(alice.hide_seen_on_exit().await.unwrap(), 1);

        let messages = alice.docs.list_messages().await.unwrap();
        let for_alice = ids(alice.observe(messages.clone()).await).join(",");
        assert!(!for_alice.contains(seen.as_str()));
        assert!(for_alice.contains(pinned.as_str()));
        assert!(for_alice.contains(own.as_str()));
        bob.set_mode(DisappearingMode::Instant).await;
        assert_eq!(bob.observe(messages).await.len(), 4);

        assert_eq!(alice.restore().await.unwrap(), 1);
        let messages = alice.docs.list_messages().await.unwrap();
        assert_eq!(alice.observe(messages).await.len(), 4);
    }

    #[tokio::test]
    async fn test_restore_unhides_but_never_resurrects_expired() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = lifecycle(store, "alice");

        let old = NewMessage {
            sender_id: user("bob"),
            text: Some("old".into()),
            media: None,
            created_at: now() - Duration::hours(25),
            reply_to: None,
        };
        let expired = alice.docs.append_message(&old).await.unwrap();
        let hidden = alice
            .docs
            .append_message(&NewMessage {
                text: Some("hidden".into()),
                created_at: now() - Duration::hours(1),
                ..old
            })
            .await
            .unwrap();
        alice.docs.hide_for(&hidden, &user("alice")).await.unwrap();

        let messages = alice.docs.list_messages().await.unwrap();
        assert!(alice.observe(messages).await.is_empty());
        assert!(alice.docs.get_message(&expired).await.unwrap().is_none());

        assert_eq!(alice.restore().await.unwrap(), 1);
        let messages = alice.docs.list_messages().await.unwrap();
        let visible = alice.observe(messages).await;
        assert_eq!(ids(visible), vec![hidden.as_str()]);
    }
}
