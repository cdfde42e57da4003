//! Telegram delivery through a queued outbox

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::db::TelegramOutbox;
use crate::error::Result;

/// A message waiting in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

impl TelegramMessage {
    /// A message rendered as Telegram Markdown
    pub fn markdown(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            parse_mode: Some("Markdown".to_string()),
        }
    }
}

/// Outcome of one outbox flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Drains the outbox through the Telegram Bot API
pub struct TelegramSender {
    client: Client,
    api_url: String,
    token: Option<String>,
    outbox: Arc<dyn TelegramOutbox>,
    batch_size: usize,
}

impl TelegramSender {
    /// Create a new sender; without a token queued messages are dropped
    pub fn new(
        outbox: Arc<dyn TelegramOutbox>,
        api_url: impl Into<String>,
        token: Option<String>,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            outbox,
            batch_size,
        })
    }

    /// Send one batch of queued messages; failed messages are not requeued
    pub async fn flush(&self) -> Result<FlushSummary> {
        let messages = self.outbox.dequeue_batch(self.batch_size).await?;
        if messages.is_empty() {
            return Ok(FlushSummary::default());
        }

        let Some(token) = self.token.as_deref() else {
            warn!(count = messages.len(), "Telegram bot token not configured, dropping messages");
            return Ok(FlushSummary {
                sent: 0,
                failed: messages.len(),
            });
        };

        let results = join_all(messages.iter().map(|m| self.send(token, m))).await;

        let mut summary = FlushSummary::default();
        for (message, result) in messages.iter().zip(results) {
            match result {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    error!(
                        chat_id = %message.chat_id,
                        error = %e,
                        "Error sending Telegram message"
                    );
                    summary.failed += 1;
                }
            }
        }

        debug!(sent = summary.sent, failed = summary.failed, "Flushed Telegram outbox");
        Ok(summary)
    }

    async fn send(&self, token: &str, message: &TelegramMessage) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, token);
        self.client
            .post(url)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryOutbox;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_queued_messages_and_counts_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({ "chat_id": "1" })))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({ "chat_id": "2" })))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let outbox = Arc::new(MemoryOutbox::default());
        outbox.push(TelegramMessage::markdown("1", "*hello*"));
        outbox.push(TelegramMessage::markdown("2", "blocked the bot"));

        let sender = TelegramSender::new(
            outbox.clone(),
            server.uri(),
            Some("TOKEN".to_string()),
            10,
            Duration::from_secs(5),
        )
        .unwrap();

        let summary = sender.flush().await.unwrap();

        assert_eq!(summary, FlushSummary { sent: 1, failed: 1 });
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn respects_batch_size() {
        let outbox = Arc::new(MemoryOutbox::default());
        for chat in 0..5 {
            outbox.push(TelegramMessage::markdown(chat.to_string(), "hi"));
        }

        let sender =
            TelegramSender::new(outbox.clone(), "http://unused", None, 2, Duration::from_secs(1))
                .unwrap();

        let summary = sender.flush().await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(outbox.len(), 3);
    }
}
