use duet_shared::{MessageId, UserId};
use serde_json::Value;
use tracing::warn;

use crate::documents::ChatDocuments;
use crate::error::Result;
use crate::models::{Message, NewMessage};
use crate::store::{Direction, Document, Patch, Query};

impl ChatDocuments {
    /// All messages of the chat, oldest first.
    pub fn messages_query(&self) -> Query {
        Query::new(self.messages_collection()).order_by("createdAt", Direction::Ascending)
    }

    pub async fn append_message(&self, message: &NewMessage) -> Result<MessageId> {
        let id = self
            .store()
            .append(&self.messages_collection(), message.to_fields()?)
            .await?;
        Ok(MessageId(id))
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        match self.store().get(&self.message_doc(id)).await? {
            Some(doc) => Ok(Some(Message::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    pub async fn list_messages(&self) -> Result<Vec<Message>> {
        let docs = self.store().query(&self.messages_query()).await?;
        Ok(decode_messages(&docs))
    }

    /// Messages from `sender` that the recipient has already seen.
    pub async fn seen_messages_from(&self, sender: &UserId) -> Result<Vec<Message>> {
        let query = Query::new(self.messages_collection())
            .where_eq("senderId", sender.as_str())
            .where_eq("seen", true);
        let docs = self.store().query(&query).await?;
        Ok(decode_messages(&docs))
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<()> {
        self.store().delete(&self.message_doc(id)).await
    }

    pub async fn mark_seen(&self, id: &MessageId) -> Result<()> {
        self.store()
            .update(&self.message_doc(id), Patch::new().set("seen", true))
            .await
    }

    pub async fn set_saved(&self, id: &MessageId, saved: bool) -> Result<()> {
        self.store()
            .update(&self.message_doc(id), Patch::new().set("saved", saved))
            .await
    }

    /// Add `viewer` to the message's `hiddenFor` set.
    pub async fn hide_for(&self, id: &MessageId, viewer: &UserId) -> Result<()> {
        self.store()
            .update(
                &self.message_doc(id),
                Patch::new().array_union("hiddenFor", vec![Value::from(viewer.as_str())]),
            )
            .await
    }

    pub async fn clear_hidden(&self, id: &MessageId) -> Result<()> {
        self.store()
            .update(
                &self.message_doc(id),
                Patch::new().set("hiddenFor", Value::Array(Vec::new())),
            )
            .await
    }
}

/// Decode message documents, skipping any that are malformed.
pub fn decode_messages(docs: &[Document]) -> Vec<Message> {
    docs.iter()
        .filter_map(|doc| match Message::from_document(doc) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(path = %doc.path, error = %e, "skipping malformed message");
                None
            }
        })
        .collect()
}
