//! Project data models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-defined outbound webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    /// Cleared after a failed delivery
    pub url: Option<String>,
}

/// Notification settings of a project's administrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAdmin {
    pub id: Uuid,
    pub email: String,
    pub telegram_chat_id: Option<String>,
    pub is_telegram_chat_id_confirmed: bool,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub webhooks: Vec<Webhook>,
}

impl ProjectAdmin {
    /// Telegram chat to notify, if confirmed
    pub fn confirmed_telegram_chat(&self) -> Option<&str> {
        if self.is_telegram_chat_id_confirmed {
            self.telegram_chat_id.as_deref()
        } else {
            None
        }
    }

    /// Whether any chat channel is set up
    pub fn has_chat_channel(&self) -> bool {
        self.confirmed_telegram_chat().is_some()
            || self.slack_webhook_url.is_some()
            || self.discord_webhook_url.is_some()
    }
}

/// An analytics project together with its administrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub admin: ProjectAdmin,
}
