//! Chat settings and peer profile records.

use duet_shared::UserId;
use serde_json::Value;

use crate::documents::ChatDocuments;
use crate::error::Result;
use crate::models::{ChatSettings, DisappearingMode, PeerProfile};
use crate::store::Fields;

impl ChatDocuments {
    pub async fn get_settings(&self) -> Result<ChatSettings> {
        let doc = self.store().get(&self.chat_doc()).await?;
        ChatSettings::from_document(doc.as_ref())
    }

    /// Merge the new mode into the settings document.
    pub async fn set_disappearing_mode(&self, mode: DisappearingMode) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("disappearingMode".into(), Value::from(mode.as_str()));
        self.store().set(&self.chat_doc(), fields, true).await
    }

    /// Merge a new wallpaper URL; `None` clears it.
    pub async fn set_wallpaper(&self, url: Option<&str>) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(
            "wallpaperUrl".into(),
            url.map(Value::from).unwrap_or(Value::Null),
        );
        self.store().set(&self.chat_doc(), fields, true).await
    }

    pub async fn get_profile(&self, user: &UserId) -> Result<PeerProfile> {
        match self.store().get(&Self::profile_doc(user)).await? {
            Some(doc) => doc.decode(),
            None => Ok(PeerProfile::default()),
        }
    }
}
