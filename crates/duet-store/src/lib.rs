//! # duet-store
//!
//! The realtime document store seen from the chat core.
//!
//! [`RealtimeStore`] is the capability every component talks to: document
//! get/set/update/delete, append-only collections, one-shot queries and push
//! subscriptions with ordered, at-least-once delivery. [`MemoryStore`] is the
//! in-process backend used by tests and the loopback demo. [`ChatDocuments`]
//! layers typed helpers for one chat on top of any backend.

pub mod documents;
pub mod memory;
pub mod messages;
pub mod models;
pub mod path;
pub mod settings;
pub mod store;

mod error;

pub use documents::ChatDocuments;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use path::{CollectionPath, DocPath};
pub use store::{
    ChangeKind, DocStream, Document, DocumentChange, Fields, Patch, Query, QuerySnapshot,
    QueryStream, RealtimeStore,
};
