//! # duet-client
//!
//! One-to-one chat sessions on top of a realtime document store: message
//! delivery with disappearing modes, saved messages, replies and a WebRTC
//! call per chat. Open a chat with [`ChatSession::open`] and drive it
//! through the returned [`ChatHandle`].

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod presence;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ChatConfig;
pub use error::ChatError;
pub use events::SessionEvent;
pub use lifecycle::{evaluate, Draft, Evaluation, MessageLifecycle};
pub use presence::describe_last_seen;
pub use session::{CallCommand, ChatDeps, ChatHandle, ChatSession};

/// Install the global `fmt` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("duet_client=debug,duet_media=debug,duet_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
