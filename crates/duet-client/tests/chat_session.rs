//! End-to-end chat sessions: two devices sharing one in-memory store, with
//! scripted peer connections and media.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use duet_client::{ChatConfig, ChatDeps, ChatError, ChatHandle, ChatSession, Draft, SessionEvent};
use duet_media::testing::{ScriptedMedia, ScriptedPeerFactory};
use duet_media::{CallState, EndReason};
use duet_shared::{ManualClock, UserId};
use duet_store::{ChatDocuments, DisappearingMode, MemoryStore, Message, RealtimeStore};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Device {
    chat: ChatHandle,
    events: mpsc::Receiver<SessionEvent>,
    peers: Arc<ScriptedPeerFactory>,
    media: Arc<ScriptedMedia>,
    lock: watch::Sender<bool>,
}

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ))
}

async fn open(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, me: &str, other: &str) -> Device {
    let peers = Arc::new(ScriptedPeerFactory::new(me));
    let media = Arc::new(ScriptedMedia::new());
    let deps = ChatDeps::new(store.clone())
        .with_peers(peers.clone())
        .with_media(media.clone())
        .with_clock(clock.clone());
    let (lock, lock_rx) = watch::channel(false);

    let (chat, events) = ChatSession::open(&ChatConfig::default(), deps, user(me), user(other), lock_rx)
        .await
        .unwrap();
    Device {
        chat,
        events,
        peers,
        media,
        lock,
    }
}

impl Device {
    /// Next event matching `pred`, skipping everything before it.
    async fn expect(&mut self, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("session closed while waiting for an event"),
                }
            }
        })
        .await
        .expect("timed out waiting for an event")
    }

    async fn expect_state(&mut self, state: CallState) {
        self.expect(|e| *e == SessionEvent::CallStateChanged(state.clone()))
            .await;
    }

    async fn expect_messages(&mut self, mut pred: impl FnMut(&[Message]) -> bool) -> Vec<Message> {
        match self
            .expect(|e| matches!(e, SessionEvent::MessagesUpdated(m) if pred(m)))
            .await
        {
            SessionEvent::MessagesUpdated(messages) => messages,
            _ => unreachable!(),
        }
    }
}

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().filter_map(|m| m.text.as_deref()).collect()
}

async fn connected_pair() -> (Arc<MemoryStore>, Device, Device) {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;
    let mut bob = open(&store, &clock, "bob", "alice").await;

    alice.chat.start_call().await.unwrap();
    bob.expect(|e| matches!(e, SessionEvent::IncomingCall { .. }))
        .await;
    bob.chat.accept_call().await.unwrap();

    alice.expect_state(CallState::Connected).await;
    bob.expect_state(CallState::Connected).await;
    (store, alice, bob)
}

#[tokio::test]
async fn test_incoming_call_carries_caller_profile() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    store
        .set(
            &ChatDocuments::profile_doc(&user("alice")),
            json!({ "displayName": "Alice" }).as_object().cloned().unwrap(),
            false,
        )
        .await
        .unwrap();

    let mut alice = open(&store, &clock, "alice", "bob").await;
    let mut bob = open(&store, &clock, "bob", "alice").await;
    bob.expect(|e| matches!(e, SessionEvent::PeerProfile(p) if p.display_name.is_some()))
        .await;

    alice.chat.start_call().await.unwrap();
    let ringing = bob
        .expect(|e| matches!(e, SessionEvent::IncomingCall { .. }))
        .await;
    assert_eq!(
        ringing,
        SessionEvent::IncomingCall {
            from: user("alice"),
            display_name: Some("Alice".into()),
        }
    );
    bob.expect(|e| *e == SessionEvent::Status("Incoming call".into()))
        .await;
    assert_eq!(bob.chat.call_state().await.unwrap(), CallState::Ringing);
    alice.expect_state(CallState::AwaitingAnswer).await;
}

#[tokio::test]
async fn test_call_connects_and_remote_hangup_ends_both_sides() {
    let (_store, mut alice, mut bob) = connected_pair().await;

    let caller = alice.peers.last().unwrap();
    assert_eq!(caller.remote.unwrap().sdp, "bob-1-answer");

    alice.chat.end_call().await.unwrap();
    alice
        .expect_state(CallState::Ended(EndReason::LocalHangup))
        .await;
    bob.expect_state(CallState::Ended(EndReason::RemoteHangup))
        .await;

    assert_eq!(alice.media.live(), 0);
    assert_eq!(bob.media.live(), 0);
    assert!(bob.peers.last().unwrap().closed);
}

#[tokio::test]
async fn test_reject_ends_the_callers_attempt() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;
    let mut bob = open(&store, &clock, "bob", "alice").await;

    alice.chat.start_call().await.unwrap();
    bob.expect(|e| matches!(e, SessionEvent::IncomingCall { .. }))
        .await;
    bob.chat.reject_call().await.unwrap();

    bob.expect_state(CallState::Ended(EndReason::Rejected)).await;
    alice
        .expect_state(CallState::Ended(EndReason::RemoteHangup))
        .await;
    assert_eq!(bob.media.acquired(), 0);
}

#[tokio::test]
async fn test_device_lock_ends_the_call() {
    let (_store, mut alice, mut bob) = connected_pair().await;

    bob.lock.send(true).unwrap();

    bob.expect_state(CallState::Ended(EndReason::Locked)).await;
    alice
        .expect_state(CallState::Ended(EndReason::RemoteHangup))
        .await;
}

#[tokio::test]
async fn test_media_failure_reports_error_then_ends() {
    let store = Arc::new(MemoryStore::new());
    let mut alice = open(&store, &clock(), "alice", "bob").await;
    alice.media.fail_with(Some("permission denied"));

    alice.chat.start_call().await.unwrap();

    alice
        .expect(|e| {
            *e == SessionEvent::Status(
                "Error: Could not access camera or microphone: permission denied".into(),
            )
        })
        .await;
    alice
        .expect(|e| {
            matches!(
                e,
                SessionEvent::CallStateChanged(CallState::Ended(EndReason::Failed(_)))
            )
        })
        .await;
    assert_eq!(alice.peers.created(), 0);
}

#[tokio::test]
async fn test_accept_without_incoming_call_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let mut alice = open(&store, &clock(), "alice", "bob").await;

    let err = alice.chat.accept_call().await.unwrap_err();
    assert!(matches!(err, ChatError::Call(_)));
    alice
        .expect(|e| matches!(e, SessionEvent::Status(s) if s.starts_with("Error: ")))
        .await;
    assert_eq!(alice.chat.call_state().await.unwrap(), CallState::Idle);
}

#[tokio::test]
async fn test_closing_during_a_call_hangs_up_and_unsubscribes() {
    let (store, alice, mut bob) = connected_pair().await;

    alice.chat.close().await.unwrap();
    bob.expect_state(CallState::Ended(EndReason::RemoteHangup))
        .await;
    assert_eq!(alice.media.live(), 0);

    bob.chat.close().await.unwrap();
    timeout(WAIT, async {
        while store.subscriber_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriptions still open after close");
}

#[tokio::test]
async fn test_messages_are_delivered_and_marked_seen() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let alice = open(&store, &clock, "alice", "bob").await;
    let mut bob = open(&store, &clock, "bob", "alice").await;

    let id = alice.chat.send(Draft::text("hello")).await.unwrap();
    let visible = bob.expect_messages(|m| !m.is_empty()).await;
    assert_eq!(visible[0].id, id);

    let messages = bob.expect_messages(|m| m.iter().any(|m| m.seen)).await;
    assert_eq!(texts(&messages), vec!["hello"]);
    assert_eq!(alice.chat.send(Draft::text("  ")).await, Err(ChatError::EmptyMessage));
}

#[tokio::test]
async fn test_reply_carries_a_snapshot_of_the_original() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;
    let mut bob = open(&store, &clock, "bob", "alice").await;

    let question = alice.chat.send(Draft::text("lunch?")).await.unwrap();
    bob.expect_messages(|m| !m.is_empty()).await;

    let snapshot = bob.chat.reply(&question).await.unwrap();
    assert_eq!(snapshot.text.as_deref(), Some("lunch?"));
    bob.chat.send(Draft::text("sure")).await.unwrap();

    let messages = alice.expect_messages(|m| m.len() == 2).await;
    let answer = &messages[1];
    assert_eq!(answer.reply_to.as_ref().map(|r| &r.id), Some(&question));

    // The reply target is consumed by the send.
    bob.chat.send(Draft::text("noon?")).await.unwrap();
    let messages = alice.expect_messages(|m| m.len() == 3).await;
    assert!(messages[2].reply_to.is_none());
}

#[tokio::test]
async fn test_day_mode_expires_unsaved_messages() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;

    alice.chat.send(Draft::text("old")).await.unwrap();
    let keep = alice.chat.send(Draft::text("keep")).await.unwrap();
    assert!(alice.chat.toggle_saved(&keep).await.unwrap());
    alice
        .expect_messages(|m| m.iter().any(|m| m.saved))
        .await;

    clock.advance(chrono::Duration::hours(25));
    alice.chat.send(Draft::text("fresh")).await.unwrap();

    let messages = alice.expect_messages(|m| texts(m) == ["keep", "fresh"]).await;
    assert!(messages[0].saved);
    let stored = ChatDocuments::new(store.clone(), alice.chat.chat_id().clone())
        .list_messages()
        .await
        .unwrap();
    assert_eq!(texts(&stored), vec!["keep", "fresh"]);
}

#[tokio::test]
async fn test_off_mode_keeps_old_messages() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;
    alice
        .chat
        .set_disappearing_mode(DisappearingMode::Off)
        .await
        .unwrap();

    alice.chat.send(Draft::text("old")).await.unwrap();
    alice.expect_messages(|m| m.len() == 1).await;

    clock.advance(chrono::Duration::days(3));
    alice.chat.send(Draft::text("new")).await.unwrap();
    let messages = alice.expect_messages(|m| m.len() == 2).await;
    assert_eq!(texts(&messages), vec!["old", "new"]);
}

#[tokio::test]
async fn test_instant_mode_hides_seen_messages_on_close() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let mut alice = open(&store, &clock, "alice", "bob").await;
    let bob = open(&store, &clock, "bob", "alice").await;

    alice
        .chat
        .set_disappearing_mode(DisappearingMode::Instant)
        .await
        .unwrap();
    alice
        .expect(|e| {
            matches!(e, SessionEvent::SettingsChanged(s) if s.disappearing_mode == DisappearingMode::Instant)
        })
        .await;

    bob.chat.send(Draft::text("psst")).await.unwrap();
    alice.expect_messages(|m| m.iter().any(|m| m.seen)).await;
    alice.chat.close().await.unwrap();

    // Hidden for alice only.
    let mut alice = open(&store, &clock, "alice", "bob").await;
    alice.expect_messages(|m| m.is_empty()).await;
    assert_eq!(texts(&bob.chat.messages().await.unwrap()), vec!["psst"]);

    assert_eq!(alice.chat.restore().await.unwrap(), 1);
    alice.expect_messages(|m| texts(m) == ["psst"]).await;
}

#[tokio::test]
async fn test_saved_messages_cannot_be_deleted() {
    let store = Arc::new(MemoryStore::new());
    let mut alice = open(&store, &clock(), "alice", "bob").await;

    let id = alice.chat.send(Draft::text("remember")).await.unwrap();
    assert!(alice.chat.toggle_saved(&id).await.unwrap());

    assert_eq!(
        alice.chat.delete(&id).await,
        Err(ChatError::SavedMessageProtected)
    );
    alice
        .expect(|e| {
            *e == SessionEvent::Status("Saved messages can't be deleted. Unsave it first.".into())
        })
        .await;

    assert!(!alice.chat.toggle_saved(&id).await.unwrap());
    alice.chat.delete(&id).await.unwrap();
    alice.expect_messages(|m| m.is_empty()).await;
}

#[tokio::test]
async fn test_commands_after_close_report_closed_session() {
    let store = Arc::new(MemoryStore::new());
    let alice = open(&store, &clock(), "alice", "bob").await;

    alice.chat.close().await.unwrap();
    alice.chat.close().await.unwrap();
    assert_eq!(
        alice.chat.send(Draft::text("anyone?")).await,
        Err(ChatError::SessionClosed)
    );
}
