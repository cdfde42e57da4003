//! Notification delivery for alerts

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::telegram::TelegramMessage;
use crate::db::TelegramOutbox;
use crate::models::ProjectAdmin;

/// Webhook event name for online users alerts
pub const ONLINE_USERS_EVENT: &str = "user.alert.online-users";

/// Webhook event name for metric alerts
pub const METRICS_EVENT: &str = "user.alert.metrics";

/// Channel a notification went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationChannel {
    Telegram,
    Slack,
    Discord,
    Webhook { id: Uuid, name: String },
}

impl NotificationChannel {
    /// Short channel name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Webhook { .. } => "webhook",
        }
    }
}

/// Result of sending a notification
#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub channel: NotificationChannel,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// A rendered alert ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotification {
    /// Markdown text for chat channels
    pub text: String,
    /// Event name for custom webhooks
    pub event: &'static str,
    /// Structured payload for custom webhooks
    pub data: serde_json::Value,
}

/// Sends notifications through the admin's channels
pub struct NotificationSender {
    client: Client,
    outbox: Arc<dyn TelegramOutbox>,
}

impl NotificationSender {
    /// Create a new notification sender
    pub fn new(outbox: Arc<dyn TelegramOutbox>, timeout: Duration) -> crate::error::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, outbox })
    }

    /// Send a notification to every configured channel of the admin
    pub async fn dispatch(
        &self,
        admin: &ProjectAdmin,
        notification: &AlertNotification,
    ) -> Vec<NotificationResult> {
        let mut results = Vec::new();

        if let Some(chat_id) = admin.confirmed_telegram_chat() {
            let message = TelegramMessage::markdown(chat_id, &notification.text);
            let result = self
                .outbox
                .enqueue(&message)
                .await
                .map_err(|e| NotificationError::Queue(e.to_string()));
            results.push(finish(NotificationChannel::Telegram, result));
        }

        if let Some(url) = &admin.slack_webhook_url {
            let payload = SlackPayload {
                text: &notification.text,
            };
            let result = self.post_json(url, &payload, "Slack").await;
            results.push(finish(NotificationChannel::Slack, result));
        }

        if let Some(url) = &admin.discord_webhook_url {
            let payload = DiscordPayload {
                content: &notification.text,
            };
            let result = self.post_json(url, &payload, "Discord").await;
            results.push(finish(NotificationChannel::Discord, result));
        }

        for webhook in &admin.webhooks {
            let Some(url) = &webhook.url else {
                continue;
            };

            let payload = WebhookPayload {
                event: notification.event,
                data: &notification.data,
            };
            let result = self.post_json(url, &payload, "Webhook").await;
            results.push(finish(
                NotificationChannel::Webhook {
                    id: webhook.id,
                    name: webhook.name.clone(),
                },
                result,
            ));
        }

        debug!(admin_id = %admin.id, channels = results.len(), "Dispatched notification");
        results
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        target: &str,
    ) -> Result<(), NotificationError> {
        let url = Url::parse(url).map_err(|e| NotificationError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .post(url.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::HttpError(format!(
                "{target} returned {status}: {body}"
            )));
        }

        info!(url = %url, target, "Notification sent");
        Ok(())
    }
}

fn finish(
    channel: NotificationChannel,
    result: Result<(), NotificationError>,
) -> NotificationResult {
    NotificationResult {
        channel,
        success: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        sent_at: Utc::now(),
    }
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Queue error: {0}")]
    Queue(String),
}

#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct DiscordPayload<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    data: &'a serde_json::Value,
}
