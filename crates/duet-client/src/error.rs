use duet_media::CallError;
use duet_shared::MessageId;
use duet_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Saved messages are exempt from deletion until unsaved.
    #[error("Saved messages can't be deleted. Unsave it first.")]
    SavedMessageProtected,

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Nothing to send")]
    EmptyMessage,

    #[error("Chat session is closed")]
    SessionClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl ChatError {
    /// Single-line status suitable for showing to the user.
    pub fn status(&self) -> String {
        match self {
            ChatError::Store(e) | ChatError::Call(CallError::Store(e)) if e.is_unavailable() => {
                "Can't reach the server. Check your connection.".into()
            }
            ChatError::Call(e) => format!("Error: {e}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(
            ChatError::SavedMessageProtected.status(),
            "Saved messages can't be deleted. Unsave it first."
        );
        assert_eq!(
            ChatError::Call(CallError::NoOffer).status(),
            "Error: No offer to answer"
        );
        assert!(ChatError::Store(StoreError::Unavailable("down".into()))
            .status()
            .starts_with("Can't reach"));
    }
}
