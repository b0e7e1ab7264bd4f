//! # duet-loopback
//!
//! Two chat sessions sharing one in-memory store, talking over real
//! `webrtc` peer connections on this machine. Alice sends a message and
//! calls Bob, Bob answers, Alice hangs up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use duet_client::{init_tracing, ChatConfig, ChatDeps, ChatSession, Draft, SessionEvent};
use duet_media::CallState;
use duet_shared::UserId;
use duet_store::{MemoryStore, RealtimeStore};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting duet loopback v{}", env!("CARGO_PKG_VERSION"));

    let config = ChatConfig::from_env();
    info!(?config, "Loaded configuration");

    let store: Arc<dyn RealtimeStore> = Arc::new(MemoryStore::new());
    let alice = UserId::new("alice")?;
    let bob = UserId::new("bob")?;

    // Neither device ever locks; the senders only need to outlive the run.
    let (_alice_lock, alice_lock_rx) = watch::channel(false);
    let (_bob_lock, bob_lock_rx) = watch::channel(false);

    let (alice_chat, alice_events) = ChatSession::open(
        &config,
        ChatDeps::new(store.clone()),
        alice.clone(),
        bob.clone(),
        alice_lock_rx,
    )
    .await
    .context("opening alice's session")?;
    let (bob_chat, mut bob_events) = ChatSession::open(
        &config,
        ChatDeps::new(store),
        bob,
        alice,
        bob_lock_rx,
    )
    .await
    .context("opening bob's session")?;

    let printer = tokio::spawn(print_events("alice", alice_events));

    let id = alice_chat.send(Draft::text("hi bob, calling you now")).await?;
    info!(message = %id, "Message sent");

    alice_chat.start_call().await?;
    wait_for(&mut bob_events, |e| matches!(e, SessionEvent::IncomingCall { .. }))
        .await
        .context("waiting for the incoming call")?;

    bob_chat.accept_call().await?;
    let outcome = wait_for(&mut bob_events, |e| {
        matches!(
            e,
            SessionEvent::CallStateChanged(CallState::Connected | CallState::Ended(_))
        )
    })
    .await
    .context("waiting for the call to connect")?;
    if !matches!(outcome, SessionEvent::CallStateChanged(CallState::Connected)) {
        bail!("call did not connect: {outcome:?}");
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    alice_chat.end_call().await?;
    wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::CallStateChanged(CallState::Ended(_)))
    })
    .await
    .context("waiting for the remote hangup")?;

    alice_chat.close().await?;
    bob_chat.close().await?;
    drop(alice_chat);
    printer.await?;

    info!("Loopback finished");
    Ok(())
}

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    loop {
        let event = timeout(STEP_TIMEOUT, events.recv())
            .await
            .context("timed out")?
            .context("session closed")?;
        println!("[bob]   {event:?}");
        if pred(&event) {
            return Ok(event);
        }
    }
}

async fn print_events(who: &'static str, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        println!("[{who}] {event:?}");
    }
}
