//! Typed access to the documents of one chat.
//!
//! [`ChatDocuments`] binds a store handle to a chat identity and knows where
//! each record of that chat lives:
//!
//! ```text
//! chats/{chatId}                                   settings
//! chats/{chatId}/messages/{messageId}              messages
//! chats/{chatId}/call/signaling                    rendezvous record
//! chats/{chatId}/call/signaling/callerCandidates   candidate log
//! chats/{chatId}/call/signaling/calleeCandidates   candidate log
//! users/{userId}                                   profiles
//! ```
//!
//! The typed helpers are split by record type: messages in `messages.rs`,
//! chat settings and peer profiles in `settings.rs`.

use std::sync::Arc;

use duet_shared::constants::{
    CALL_COLLECTION, CHATS_COLLECTION, MESSAGES_COLLECTION, SIGNALING_DOC, USERS_COLLECTION,
};
use duet_shared::protocol::CandidateRole;
use duet_shared::{ChatId, MessageId, UserId};

use crate::path::{CollectionPath, DocPath};
use crate::store::RealtimeStore;

#[derive(Clone)]
pub struct ChatDocuments {
    store: Arc<dyn RealtimeStore>,
    chat_id: ChatId,
}

impl ChatDocuments {
    pub fn new(store: Arc<dyn RealtimeStore>, chat_id: ChatId) -> Self {
        Self { store, chat_id }
    }

    pub fn store(&self) -> &Arc<dyn RealtimeStore> {
        &self.store
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn chat_doc(&self) -> DocPath {
        CollectionPath::root(CHATS_COLLECTION).doc(self.chat_id.as_str())
    }

    pub fn messages_collection(&self) -> CollectionPath {
        self.chat_doc().collection(MESSAGES_COLLECTION)
    }

    pub fn message_doc(&self, id: &MessageId) -> DocPath {
        self.messages_collection().doc(id.as_str())
    }

    pub fn rendezvous_doc(&self) -> DocPath {
        self.chat_doc()
            .collection(CALL_COLLECTION)
            .doc(SIGNALING_DOC)
    }

    pub fn candidate_log(&self, role: CandidateRole) -> CollectionPath {
        self.rendezvous_doc().collection(role.collection())
    }

    pub fn profile_doc(user: &UserId) -> DocPath {
        CollectionPath::root(USERS_COLLECTION).doc(user.as_str())
    }
}

impl std::fmt::Debug for ChatDocuments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatDocuments")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}
